use std::fmt;

pub const DB_PREFIX: &str = "db-";
pub const SIGN_PREFIX: &str = "sign-";

/// What a scheduled job runs. The job id is a pure function of the source
/// and the task identity, so it is stable across syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Db {
        id: i64,
        name: String,
        account: String,
    },
    Sign {
        name: String,
        account: String,
    },
}

impl RunTarget {
    pub fn job_id(&self) -> String {
        match self {
            RunTarget::Db { id, .. } => format!("{DB_PREFIX}{id}"),
            RunTarget::Sign { name, .. } => format!("{SIGN_PREFIX}{name}"),
        }
    }

    pub fn account(&self) -> &str {
        match self {
            RunTarget::Db { account, .. } | RunTarget::Sign { account, .. } => account,
        }
    }

    pub fn task_name(&self) -> &str {
        match self {
            RunTarget::Db { name, .. } | RunTarget::Sign { name, .. } => name,
        }
    }
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.job_id(), self.account())
    }
}

/// Identity carried by a scheduler callback; resolved against the stores
/// when the job fires so the run sees current task data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Db(i64),
    Sign(String),
}

impl JobKey {
    pub fn parse(job_id: &str) -> Option<Self> {
        if let Some(id) = job_id.strip_prefix(DB_PREFIX) {
            return id.parse().ok().map(JobKey::Db);
        }
        job_id
            .strip_prefix(SIGN_PREFIX)
            .filter(|name| !name.is_empty())
            .map(|name| JobKey::Sign(name.to_string()))
    }

    pub fn job_id(&self) -> String {
        match self {
            JobKey::Db(id) => format!("{DB_PREFIX}{id}"),
            JobKey::Sign(name) => format!("{SIGN_PREFIX}{name}"),
        }
    }
}

pub fn is_managed(job_id: &str) -> bool {
    job_id.starts_with(DB_PREFIX) || job_id.starts_with(SIGN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_namespaced_by_source() {
        let db = RunTarget::Db {
            id: 17,
            name: "checkin".to_string(),
            account: "alice".to_string(),
        };
        let sign = RunTarget::Sign {
            name: "daily-checkin".to_string(),
            account: "alice".to_string(),
        };
        assert_eq!(db.job_id(), "db-17");
        assert_eq!(sign.job_id(), "sign-daily-checkin");
        assert_eq!(JobKey::parse("db-17"), Some(JobKey::Db(17)));
        assert_eq!(
            JobKey::parse("sign-daily-checkin"),
            Some(JobKey::Sign("daily-checkin".to_string()))
        );
    }

    #[test]
    fn foreign_ids_do_not_parse() {
        assert_eq!(JobKey::parse("system-maintenance"), None);
        assert_eq!(JobKey::parse("db-abc"), None);
        assert_eq!(JobKey::parse("sign-"), None);
        assert!(!is_managed("system-maintenance"));
        assert!(is_managed("db-3"));
    }
}
