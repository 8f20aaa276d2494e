use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{
    SIGN_CONFIG_VERSION, SignTask, SignTaskDraft, SignTaskFile, SignTaskPatch,
};
use crate::core::error::{EngineError, EngineResult};
use crate::core::history::RunRecord;

const CONFIG_NAME: &str = "config.json";

/// Read side of the filesystem sign-task store, as the engine consumes it.
#[async_trait]
pub trait SignTaskStore: Send + Sync {
    /// All sign tasks sorted by account then name. Served from cache unless
    /// `force_refresh` is set or a mutation invalidated it.
    async fn list(&self, force_refresh: bool) -> EngineResult<Vec<SignTask>>;
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportReport {
    pub signs_imported: usize,
    pub signs_skipped: usize,
    pub errors: Vec<String>,
}

/// Single-task export envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignTaskExport {
    pub task_name: String,
    #[serde(default = "sign_type")]
    pub task_type: String,
    pub config: SignTaskFile,
}

fn sign_type() -> String {
    "sign".to_string()
}

/// Sign tasks stored as `signs/<account>/<task>/config.json`, with the flat
/// `signs/<task>/config.json` layout still readable. When both layouts hold
/// the same task name the per-account entry wins.
pub struct FsSignTaskStore {
    signs_dir: PathBuf,
    cache: Mutex<Option<Vec<SignTask>>>,
    /// Held across every read-modify-write of a `config.json`.
    writes: Mutex<()>,
}

impl FsSignTaskStore {
    pub fn new<P: AsRef<Path>>(signs_dir: P) -> Self {
        Self {
            signs_dir: signs_dir.as_ref().to_path_buf(),
            cache: Mutex::new(None),
            writes: Mutex::new(()),
        }
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    pub async fn get(&self, name: &str, account: Option<&str>) -> EngineResult<Option<SignTask>> {
        let Some((dir, legacy)) = self.locate(name, account).await? else {
            return Ok(None);
        };
        let file = read_config(&dir).await?;
        Ok(Some(to_task(name, &dir, legacy, file)))
    }

    pub async fn create(&self, draft: SignTaskDraft) -> EngineResult<SignTask> {
        validate_segment("task name", &draft.name)?;
        validate_segment("account name", &draft.account_name)?;
        let _write = self.writes.lock().await;
        if self.get(&draft.name, Some(&draft.account_name)).await?.is_some() {
            return Err(EngineError::InvalidInput(format!(
                "sign task '{}' already exists for {}",
                draft.name, draft.account_name
            )));
        }

        let dir = self.signs_dir.join(&draft.account_name).join(&draft.name);
        let file = SignTaskFile {
            version: SIGN_CONFIG_VERSION,
            account_name: Some(draft.account_name.clone()),
            sign_at: draft.sign_at.trim().to_string(),
            random_seconds: draft.random_seconds,
            sign_interval: draft.sign_interval,
            chats: draft.chats,
            enabled: draft.enabled,
            last_run: None,
            extra: serde_json::Map::new(),
        };
        write_config(&dir, &file).await?;
        self.invalidate().await;
        Ok(to_task(&draft.name, &dir, false, file))
    }

    /// Applies `patch`, keeping `last_run` and unknown keys as they were.
    pub async fn update(
        &self,
        name: &str,
        account: Option<&str>,
        patch: SignTaskPatch,
    ) -> EngineResult<SignTask> {
        let _write = self.writes.lock().await;
        let (dir, legacy) = self.require(name, account).await?;
        let mut file = read_config(&dir).await?;
        if let Some(sign_at) = patch.sign_at {
            file.sign_at = sign_at.trim().to_string();
        }
        if let Some(random_seconds) = patch.random_seconds {
            file.random_seconds = random_seconds;
        }
        if let Some(sign_interval) = patch.sign_interval {
            file.sign_interval = sign_interval;
        }
        if let Some(chats) = patch.chats {
            file.chats = chats;
        }
        if let Some(enabled) = patch.enabled {
            file.enabled = enabled;
        }
        file.version = SIGN_CONFIG_VERSION;
        write_config(&dir, &file).await?;
        self.invalidate().await;
        Ok(to_task(name, &dir, legacy, file))
    }

    pub async fn set_enabled(
        &self,
        name: &str,
        account: Option<&str>,
        enabled: bool,
    ) -> EngineResult<SignTask> {
        self.update(
            name,
            account,
            SignTaskPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete(&self, name: &str, account: Option<&str>) -> EngineResult<bool> {
        let _write = self.writes.lock().await;
        let Some((dir, _)) = self.locate(name, account).await? else {
            return Ok(false);
        };
        fs::remove_dir_all(&dir).await?;
        self.invalidate().await;
        Ok(true)
    }

    /// Stores the newest run outcome inside the task's own `config.json`.
    pub async fn set_last_run(
        &self,
        name: &str,
        account: Option<&str>,
        record: &RunRecord,
    ) -> EngineResult<()> {
        let _write = self.writes.lock().await;
        let (dir, _) = self.require(name, account).await?;
        let mut file = read_config(&dir).await?;
        file.last_run = Some(record.clone());
        write_config(&dir, &file).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn export(&self, name: &str) -> EngineResult<SignTaskExport> {
        let (dir, _) = self.require(name, None).await?;
        Ok(SignTaskExport {
            task_name: name.to_string(),
            task_type: sign_type(),
            config: read_config(&dir).await?,
        })
    }

    /// `{"signs": {name: config}}`. Names repeated across accounts export
    /// only their first occurrence.
    pub async fn export_all(&self) -> EngineResult<serde_json::Value> {
        let mut signs = serde_json::Map::new();
        for task in self.list(true).await? {
            if signs.contains_key(&task.name) {
                warn!(
                    "Skipping duplicate sign task '{}' of {} in export",
                    task.name, task.account_name
                );
                continue;
            }
            let file = read_config(&task.dir).await?;
            signs.insert(task.name.clone(), serde_json::to_value(file)?);
        }
        Ok(serde_json::json!({ "signs": signs }))
    }

    /// Accepts either an `export_all` bundle or a single-task export.
    pub async fn import(
        &self,
        payload: &serde_json::Value,
        overwrite: bool,
    ) -> EngineResult<ImportReport> {
        let mut report = ImportReport::default();
        let entries: Vec<(String, serde_json::Value)> =
            if let Some(signs) = payload.get("signs").and_then(|s| s.as_object()) {
                signs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            } else if let (Some(name), Some(config)) = (
                payload.get("task_name").and_then(|n| n.as_str()),
                payload.get("config"),
            ) {
                vec![(name.to_string(), config.clone())]
            } else {
                return Err(EngineError::InvalidInput(
                    "payload has neither 'signs' nor 'task_name'/'config'".to_string(),
                ));
            };

        let _write = self.writes.lock().await;
        for (name, value) in entries {
            match self.import_one(&name, value, overwrite).await {
                Ok(true) => report.signs_imported += 1,
                Ok(false) => report.signs_skipped += 1,
                Err(e) => report.errors.push(format!("{name}: {e}")),
            }
        }
        self.invalidate().await;
        Ok(report)
    }

    async fn import_one(
        &self,
        name: &str,
        value: serde_json::Value,
        overwrite: bool,
    ) -> EngineResult<bool> {
        validate_segment("task name", name)?;
        let mut file: SignTaskFile = serde_json::from_value(value)?;
        let account = file
            .account_name
            .clone()
            .filter(|a| !a.trim().is_empty());

        let dir = match &account {
            Some(account) => {
                validate_segment("account name", account)?;
                self.signs_dir.join(account).join(name)
            }
            None => self.signs_dir.join(name),
        };
        if !overwrite && dir.join(CONFIG_NAME).exists() {
            debug!("Import skipped existing sign task {}", name);
            return Ok(false);
        }
        file.version = SIGN_CONFIG_VERSION;
        write_config(&dir, &file).await?;
        Ok(true)
    }

    async fn require(&self, name: &str, account: Option<&str>) -> EngineResult<(PathBuf, bool)> {
        self.locate(name, account)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("sign task '{name}'")))
    }

    /// Resolves a task directory. With an account the per-account entry is
    /// tried first; without one, accounts are searched in sorted order. The
    /// legacy flat layout is the fallback in both cases.
    async fn locate(&self, name: &str, account: Option<&str>) -> EngineResult<Option<(PathBuf, bool)>> {
        validate_segment("task name", name)?;
        match account.filter(|a| !a.is_empty()) {
            Some(account) => {
                validate_segment("account name", account)?;
                let dir = self.signs_dir.join(account).join(name);
                if dir.join(CONFIG_NAME).exists() {
                    return Ok(Some((dir, false)));
                }
            }
            None => {
                for account_dir in self.account_dirs().await? {
                    let dir = account_dir.join(name);
                    if dir.join(CONFIG_NAME).exists() {
                        return Ok(Some((dir, false)));
                    }
                }
            }
        }
        let legacy = self.signs_dir.join(name);
        if legacy.join(CONFIG_NAME).exists() {
            return Ok(Some((legacy, true)));
        }
        Ok(None)
    }

    /// Sorted subdirectories of `signs/` that are not themselves tasks.
    async fn account_dirs(&self) -> EngineResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        if !self.signs_dir.exists() {
            return Ok(dirs);
        }
        let mut entries = fs::read_dir(&self.signs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() && !path.join(CONFIG_NAME).exists() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn scan(&self) -> EngineResult<Vec<SignTask>> {
        let mut per_account = Vec::new();
        let mut legacy = Vec::new();
        if !self.signs_dir.exists() {
            return Ok(per_account);
        }

        let mut entries = fs::read_dir(&self.signs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = file_name(&path) else {
                continue;
            };
            if path.join(CONFIG_NAME).exists() {
                if let Some(file) = load_or_warn(&path).await {
                    legacy.push(to_task(&dir_name, &path, true, file));
                }
                continue;
            }

            let mut tasks = fs::read_dir(&path).await?;
            while let Some(task_entry) = tasks.next_entry().await? {
                let task_dir = task_entry.path();
                if !task_dir.join(CONFIG_NAME).exists() {
                    continue;
                }
                let Some(task_name) = file_name(&task_dir) else {
                    continue;
                };
                if let Some(mut file) = load_or_warn(&task_dir).await {
                    // The directory decides ownership.
                    file.account_name = Some(dir_name.clone());
                    per_account.push(to_task(&task_name, &task_dir, false, file));
                }
            }
        }

        let shadowed: HashSet<String> = per_account.iter().map(|t| t.name.clone()).collect();
        for task in legacy {
            if shadowed.contains(&task.name) {
                debug!(
                    "Legacy sign task '{}' is shadowed by a per-account entry",
                    task.name
                );
                continue;
            }
            per_account.push(task);
        }
        per_account.sort_by(|a, b| {
            (a.account_name.as_str(), a.name.as_str()).cmp(&(b.account_name.as_str(), b.name.as_str()))
        });
        Ok(per_account)
    }
}

#[async_trait]
impl SignTaskStore for FsSignTaskStore {
    async fn list(&self, force_refresh: bool) -> EngineResult<Vec<SignTask>> {
        let mut cache = self.cache.lock().await;
        if !force_refresh
            && let Some(tasks) = cache.as_ref()
        {
            return Ok(tasks.clone());
        }
        let tasks = self.scan().await?;
        *cache = Some(tasks.clone());
        Ok(tasks)
    }
}

fn to_task(name: &str, dir: &Path, legacy: bool, file: SignTaskFile) -> SignTask {
    SignTask {
        name: name.to_string(),
        account_name: file.account_name.unwrap_or_default(),
        sign_at: file.sign_at,
        enabled: file.enabled,
        random_seconds: file.random_seconds,
        sign_interval: file.sign_interval,
        chats: file.chats,
        last_run: file.last_run,
        legacy,
        dir: dir.to_path_buf(),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

pub(crate) fn validate_segment(what: &str, value: &str) -> EngineResult<()> {
    let invalid = value.trim().is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value != value.trim();
    if invalid {
        return Err(EngineError::InvalidInput(format!("invalid {what} '{value}'")));
    }
    Ok(())
}

async fn read_config(dir: &Path) -> EngineResult<SignTaskFile> {
    let content = fs::read_to_string(dir.join(CONFIG_NAME)).await?;
    Ok(serde_json::from_str(&content)?)
}

async fn load_or_warn(dir: &Path) -> Option<SignTaskFile> {
    match read_config(dir).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Ignoring unreadable sign task at {}: {}", dir.display(), e);
            None
        }
    }
}

async fn write_config(dir: &Path, file: &SignTaskFile) -> EngineResult<()> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(CONFIG_NAME);
    let tmp = dir.join(format!("{CONFIG_NAME}.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::types::ChatConfig;

    fn draft(name: &str, account: &str, sign_at: &str) -> SignTaskDraft {
        SignTaskDraft {
            name: name.to_string(),
            account_name: account.to_string(),
            sign_at: sign_at.to_string(),
            random_seconds: 0,
            sign_interval: 1,
            chats: vec![ChatConfig {
                chat_id: -100123,
                name: "group".to_string(),
                actions: vec![serde_json::json!({"action": 1, "text": "/checkin"})],
                delete_after: None,
                action_interval: 1,
            }],
            enabled: true,
        }
    }

    fn write_legacy(root: &Path, name: &str, sign_at: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_NAME),
            serde_json::json!({"_version": 2, "sign_at": sign_at, "chats": []}).to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn create_lists_sorted_by_account_then_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSignTaskStore::new(dir.path());
        store.create(draft("zeta", "alice", "09:00")).await.unwrap();
        store.create(draft("alpha", "bob", "10:00")).await.unwrap();
        store.create(draft("beta", "alice", "11:00")).await.unwrap();

        let tasks = store.list(false).await.unwrap();
        let keys: Vec<_> = tasks
            .iter()
            .map(|t| (t.account_name.as_str(), t.name.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("alice", "beta"), ("alice", "zeta"), ("bob", "alpha")]
        );
    }

    #[tokio::test]
    async fn per_account_entry_shadows_legacy_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy(dir.path(), "daily", "07:00");
        write_legacy(dir.path(), "old-only", "06:00");
        let store = FsSignTaskStore::new(dir.path());
        store.create(draft("daily", "alice", "09:00")).await.unwrap();

        let tasks = store.list(true).await.unwrap();
        let daily: Vec<_> = tasks.iter().filter(|t| t.name == "daily").collect();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].sign_at, "09:00");
        assert!(!daily[0].legacy);

        let old = store.get("old-only", None).await.unwrap().unwrap();
        assert!(old.legacy);
        assert_eq!(old.account_name, "");

        let found = store.get("daily", None).await.unwrap().unwrap();
        assert_eq!(found.account_name, "alice");
    }

    #[tokio::test]
    async fn cache_serves_stale_until_forced_or_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSignTaskStore::new(dir.path());
        assert!(store.list(false).await.unwrap().is_empty());

        write_legacy(dir.path(), "external", "05:00");
        assert!(store.list(false).await.unwrap().is_empty());
        assert_eq!(store.list(true).await.unwrap().len(), 1);

        store.create(draft("mine", "alice", "09:00")).await.unwrap();
        assert_eq!(store.list(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_preserves_last_run_and_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSignTaskStore::new(dir.path());
        let task = store.create(draft("daily", "alice", "09:00")).await.unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(task.dir.join(CONFIG_NAME)).unwrap())
                .unwrap();
        raw["custom"] = serde_json::json!("kept");
        std::fs::write(task.dir.join(CONFIG_NAME), raw.to_string()).unwrap();

        let record = RunRecord::new(true, "", "alice");
        store
            .set_last_run("daily", Some("alice"), &record)
            .await
            .unwrap();
        let updated = store
            .update(
                "daily",
                Some("alice"),
                SignTaskPatch {
                    sign_at: Some("10:15".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.sign_at, "10:15");
        assert_eq!(updated.last_run, Some(record));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(task.dir.join(CONFIG_NAME)).unwrap())
                .unwrap();
        assert_eq!(raw["custom"], "kept");
        assert_eq!(raw["_version"], 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_last_run_and_edit_both_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FsSignTaskStore::new(dir.path()));
        store.create(draft("daily", "alice", "09:00")).await.unwrap();

        for i in 0..50 {
            let sign_at = format!("10:{i:02}");
            let record = RunRecord::new(i % 2 == 0, "", "alice");
            let (runs, edits) = (store.clone(), store.clone());
            let last_run = {
                let record = record.clone();
                tokio::spawn(async move {
                    runs.set_last_run("daily", Some("alice"), &record).await
                })
            };
            let edit = {
                let sign_at = sign_at.clone();
                tokio::spawn(async move {
                    edits
                        .update(
                            "daily",
                            Some("alice"),
                            SignTaskPatch {
                                sign_at: Some(sign_at),
                                ..Default::default()
                            },
                        )
                        .await
                })
            };
            last_run.await.unwrap().unwrap();
            edit.await.unwrap().unwrap();

            let task = store.get("daily", Some("alice")).await.unwrap().unwrap();
            assert_eq!(task.sign_at, sign_at);
            assert_eq!(task.last_run, Some(record));
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("alice").join("daily"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != CONFIG_NAME)
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_and_bad_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSignTaskStore::new(dir.path());
        store.create(draft("daily", "alice", "09:00")).await.unwrap();
        assert!(store.create(draft("daily", "alice", "10:00")).await.is_err());
        assert!(store.create(draft("../escape", "alice", "10:00")).await.is_err());
        assert!(store.create(draft("ok", "a/b", "10:00")).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSignTaskStore::new(dir.path());
        let task = store.create(draft("daily", "alice", "09:00")).await.unwrap();
        assert!(store.delete("daily", Some("alice")).await.unwrap());
        assert!(!task.dir.exists());
        assert!(!store.delete("daily", Some("alice")).await.unwrap());
        assert!(store.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_all_then_import_skips_existing_without_overwrite() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = FsSignTaskStore::new(source_dir.path());
        source.create(draft("daily", "alice", "09:00")).await.unwrap();
        source.create(draft("weekly", "bob", "0 9 * * 1")).await.unwrap();
        let bundle = source.export_all().await.unwrap();
        assert!(bundle["signs"]["daily"].is_object());

        let target_dir = tempfile::tempdir().unwrap();
        let target = FsSignTaskStore::new(target_dir.path());
        target.create(draft("daily", "alice", "12:00")).await.unwrap();

        let report = target.import(&bundle, false).await.unwrap();
        assert_eq!(report.signs_imported, 1);
        assert_eq!(report.signs_skipped, 1);
        assert!(report.errors.is_empty());
        let daily = target.get("daily", Some("alice")).await.unwrap().unwrap();
        assert_eq!(daily.sign_at, "12:00");

        let report = target.import(&bundle, true).await.unwrap();
        assert_eq!(report.signs_imported, 2);
        let daily = target.get("daily", Some("alice")).await.unwrap().unwrap();
        assert_eq!(daily.sign_at, "09:00");
    }

    #[tokio::test]
    async fn single_task_export_imports_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSignTaskStore::new(dir.path());
        store.create(draft("daily", "alice", "09:00")).await.unwrap();
        let exported = store.export("daily").await.unwrap();
        assert_eq!(exported.task_type, "sign");

        let mut payload = serde_json::to_value(&exported).unwrap();
        payload["task_name"] = serde_json::json!("copy");
        let report = store.import(&payload, false).await.unwrap();
        assert_eq!(report.signs_imported, 1);
        assert!(store.get("copy", Some("alice")).await.unwrap().is_some());

        let bad = store
            .import(&serde_json::json!({"nothing": true}), false)
            .await;
        assert!(bad.is_err());
    }
}
