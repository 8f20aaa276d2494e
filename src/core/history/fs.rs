use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{HistoryEntry, PruneReport, RunHistoryStore, RunRecord};
use crate::core::engine::{JobKey, RunTarget};
use crate::core::error::{EngineError, EngineResult};
use crate::core::store::FsSignTaskStore;

/// `history/<task>.json` files, newest first, capped at `limit`.
pub struct FsRunHistory {
    history_dir: PathBuf,
    signs: Arc<FsSignTaskStore>,
    limit: usize,
    /// Runs and maintenance both rewrite history files.
    writes: Mutex<()>,
}

impl FsRunHistory {
    pub fn new<P: AsRef<Path>>(history_dir: P, signs: Arc<FsSignTaskStore>, limit: usize) -> Self {
        Self {
            history_dir: history_dir.as_ref().to_path_buf(),
            signs,
            limit: limit.max(1),
            writes: Mutex::new(()),
        }
    }

    fn file_for(&self, task: &str) -> PathBuf {
        self.history_dir.join(format!("{task}.json"))
    }

    /// Every history entry owned by `account`, newest first.
    pub async fn account_history(&self, account: &str) -> EngineResult<Vec<RunRecord>> {
        let mut merged = Vec::new();
        for path in self.history_files().await? {
            merged.extend(
                read_records(&path)
                    .await
                    .into_iter()
                    .filter(|r| r.account == account),
            );
        }
        merged.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Ok(merged)
    }

    async fn history_files(&self) -> EngineResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.history_dir.exists() {
            return Ok(files);
        }
        let mut entries = tokio::fs::read_dir(&self.history_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl RunHistoryStore for FsRunHistory {
    async fn append(&self, target: &RunTarget, entry: &HistoryEntry) -> EngineResult<()> {
        let RunTarget::Sign { name, account } = target else {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a sign task",
                target.job_id()
            )));
        };
        let path = self.file_for(name);
        {
            let _write = self.writes.lock().await;
            let mut records = load_for_rewrite(&path).await?;
            records.insert(0, entry.record.clone());
            records.truncate(self.limit);
            write_records(&path, &records).await?;
        }

        let account = (!account.is_empty()).then_some(account.as_str());
        self.signs.set_last_run(name, account, &entry.record).await
    }

    async fn list(&self, key: &JobKey) -> EngineResult<Vec<RunRecord>> {
        let JobKey::Sign(name) = key else {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a sign task",
                key.job_id()
            )));
        };
        crate::core::store::validate_task_name(name)?;
        Ok(read_records(&self.file_for(name)).await)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> EngineResult<PruneReport> {
        let mut report = PruneReport::default();
        let _write = self.writes.lock().await;
        for path in self.history_files().await? {
            let records = load_for_rewrite(&path).await?;
            let before = records.len();
            let kept: Vec<RunRecord> = records
                .into_iter()
                .filter(|r| r.timestamp().is_none_or(|t| t >= cutoff))
                .collect();
            if kept.len() == before {
                continue;
            }
            report.records += before - kept.len();
            if kept.is_empty() {
                tokio::fs::remove_file(&path).await?;
                report.files += 1;
            } else {
                write_records(&path, &kept).await?;
            }
        }
        debug!(
            "Pruned {} sign history records ({} files removed)",
            report.records, report.files
        );
        Ok(report)
    }
}

/// A single object is taken as a one-entry history.
fn decode(content: &str) -> serde_json::Result<Vec<RunRecord>> {
    Ok(match serde_json::from_str::<serde_json::Value>(content)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        value @ serde_json::Value::Object(_) => {
            serde_json::from_value(value).map(|r| vec![r]).unwrap_or_default()
        }
        _ => Vec::new(),
    })
}

/// Missing or unreadable files read as empty.
async fn read_records(path: &Path) -> Vec<RunRecord> {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    decode(&content).unwrap_or_else(|e| {
        warn!("Ignoring corrupt history file {}: {}", path.display(), e);
        Vec::new()
    })
}

/// Like [`read_records`], but a corrupt file is renamed to
/// `<task>.json.corrupt-<unix secs>` so the rewrite cannot destroy it.
async fn load_for_rewrite(path: &Path) -> EngineResult<Vec<RunRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    match decode(&content) {
        Ok(records) => Ok(records),
        Err(e) => {
            let aside = path.with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
            warn!(
                "Moving corrupt history file {} to {}: {}",
                path.display(),
                aside.display(),
                e
            );
            tokio::fs::rename(path, &aside).await?;
            Ok(Vec::new())
        }
    }
}

async fn write_records(path: &Path, records: &[RunRecord]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(records)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
