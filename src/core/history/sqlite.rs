use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use super::{HistoryEntry, PruneReport, RunHistoryStore, RunRecord, format_time};
use crate::core::engine::{JobKey, RunTarget};
use crate::core::error::{EngineError, EngineResult};
use crate::core::store::Database;

/// `task_logs` rows for relational tasks, each with its full output written
/// to `task_<id>_<YYYYmmdd_HHMMSS>.log` under the logs directory.
pub struct SqliteRunHistory {
    db: Database,
    logs_dir: PathBuf,
    limit: usize,
}

impl SqliteRunHistory {
    pub fn new<P: AsRef<Path>>(db: Database, logs_dir: P, limit: usize) -> Self {
        Self {
            db,
            logs_dir: logs_dir.as_ref().to_path_buf(),
            limit: limit.max(1),
        }
    }

    async fn write_log_file(&self, task_id: i64, entry: &HistoryEntry) -> Option<PathBuf> {
        let path = self.logs_dir.join(format!(
            "task_{}_{}.log",
            task_id,
            entry.started_at.format("%Y%m%d_%H%M%S")
        ));
        if let Err(e) = tokio::fs::create_dir_all(&self.logs_dir).await {
            warn!("Cannot create logs dir {}: {}", self.logs_dir.display(), e);
            return None;
        }
        match tokio::fs::write(&path, entry.output.as_bytes()).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Cannot write run log {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl RunHistoryStore for SqliteRunHistory {
    async fn append(&self, target: &RunTarget, entry: &HistoryEntry) -> EngineResult<()> {
        let RunTarget::Db { id, .. } = target else {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a relational task",
                target.job_id()
            )));
        };
        let log_path = self.write_log_file(*id, entry).await;
        let finished_at = format_time(entry.finished_at);

        let evicted: Vec<Option<String>> = {
            let db = self.db.conn().lock().await;
            db.execute(
                "INSERT INTO task_logs (task_id, status, message, log_path, output, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    entry.status(),
                    entry.record.message,
                    log_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                    entry.output,
                    format_time(entry.started_at),
                    finished_at
                ],
            )?;
            db.execute(
                "UPDATE tasks SET last_run_at = ?2 WHERE id = ?1",
                params![id, finished_at],
            )?;

            let mut stmt = db.prepare(
                "SELECT id, log_path FROM task_logs WHERE task_id = ?1
                 ORDER BY id DESC LIMIT -1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![id, self.limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            let mut stale = Vec::new();
            for row in rows {
                stale.push(row?);
            }
            let mut evicted = Vec::with_capacity(stale.len());
            for (log_id, path) in stale {
                db.execute("DELETE FROM task_logs WHERE id = ?1", params![log_id])?;
                evicted.push(path);
            }
            evicted
        };

        for path in evicted.into_iter().flatten() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("Evicted run log {} already gone: {}", path, e);
            }
        }
        Ok(())
    }

    async fn list(&self, key: &JobKey) -> EngineResult<Vec<RunRecord>> {
        let JobKey::Db(id) = key else {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a relational task",
                key.job_id()
            )));
        };
        let db = self.db.conn().lock().await;
        let mut stmt = db.prepare(
            "SELECT COALESCE(l.finished_at, l.started_at), l.status, l.message, a.account_name
             FROM task_logs l
             JOIN tasks t ON t.id = l.task_id
             JOIN accounts a ON a.id = t.account_id
             WHERE l.task_id = ?1 ORDER BY l.id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id, self.limit as i64], |row| {
            Ok(RunRecord {
                time: row.get(0)?,
                success: row.get::<_, String>(1)? == "success",
                message: row.get(2)?,
                account: row.get(3)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> EngineResult<PruneReport> {
        let mut report = PruneReport::default();
        let paths: Vec<Option<String>> = {
            let db = self.db.conn().lock().await;
            let cutoff = format_time(cutoff);
            let mut stmt =
                db.prepare("SELECT log_path FROM task_logs WHERE started_at < ?1")?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            let mut paths = Vec::new();
            for row in rows {
                paths.push(row?);
            }
            report.records =
                db.execute("DELETE FROM task_logs WHERE started_at < ?1", params![cutoff])?;
            paths
        };

        for path in paths.into_iter().flatten() {
            if tokio::fs::remove_file(&path).await.is_ok() {
                report.files += 1;
            }
        }

        // Log files whose rows are already gone.
        if self.logs_dir.exists() {
            let cutoff: SystemTime = cutoff.into();
            let mut entries = tokio::fs::read_dir(&self.logs_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if !(name.starts_with("task_") && name.ends_with(".log")) {
                    continue;
                }
                let modified = entry.metadata().await.and_then(|m| m.modified());
                if matches!(modified, Ok(t) if t < cutoff)
                    && tokio::fs::remove_file(entry.path()).await.is_ok()
                {
                    report.files += 1;
                }
            }
        }
        debug!(
            "Pruned {} task log rows ({} files removed)",
            report.records, report.files
        );
        Ok(report)
    }
}
