//! Per-task run outcome logs. Sign tasks keep a JSON file per task; relational
//! tasks keep `task_logs` rows plus a full-output log file per run.

mod fs;
mod sqlite;

pub use fs::FsRunHistory;
pub use sqlite::SqliteRunHistory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::engine::{JobKey, RunState, RunTarget};
use crate::core::error::EngineResult;

/// Persisted outcome of one run. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub time: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "account_name")]
    pub account: String,
}

impl RunRecord {
    #[cfg(test)]
    pub fn new(success: bool, message: impl Into<String>, account: impl Into<String>) -> Self {
        Self::at(Utc::now(), success, message, account)
    }

    pub fn at(
        time: DateTime<Utc>,
        success: bool,
        message: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            time: format_time(time),
            success,
            message: message.into(),
            account: account.into(),
        }
    }

    /// `None` when the stored timestamp cannot be read.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_time(&self.time)
    }
}

/// Everything the engine knows about a finished run.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub record: RunRecord,
    pub state: RunState,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn status(&self) -> &'static str {
        match self.state {
            RunState::Succeeded => "success",
            RunState::TimedOut => "timeout",
            _ => "failed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub records: usize,
    pub files: usize,
}

impl std::ops::AddAssign for PruneReport {
    fn add_assign(&mut self, other: Self) {
        self.records += other.records;
        self.files += other.files;
    }
}

#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Prepends `entry` to the target's newest-first history and refreshes
    /// the target's latest-run snapshot.
    async fn append(&self, target: &RunTarget, entry: &HistoryEntry) -> EngineResult<()>;

    /// Newest-first history of one job. Unknown jobs have an empty history.
    async fn list(&self, key: &JobKey) -> EngineResult<Vec<RunRecord>>;

    /// Drops records and detail files older than `cutoff`.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> EngineResult<PruneReport>;
}

pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reads RFC 3339, falling back to naive ISO-8601 taken as UTC.
pub(crate) fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|t| t.and_utc())
}
