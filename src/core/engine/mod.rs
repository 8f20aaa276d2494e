mod guard;
mod maintenance;
mod reconcile;
mod runner;
mod target;
pub mod trigger;

pub use guard::{ExecutionGuard, LiveEvent, RunState};
pub use reconcile::{JobLauncher, Reconciler, SyncReport};
pub use runner::{CliInvoker, ProcessRunner, SignerInvoker};
pub use target::{JobKey, RunTarget};

#[cfg(test)]
pub(crate) use runner::testing;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::error::{EngineError, EngineResult};
use crate::core::history::{HistoryEntry, RunHistoryStore, RunRecord, format_time};
use crate::core::scheduler::{CronScheduler, JobCallback};
use crate::core::store::{SignTaskStore, TaskStore};

/// Returned to every caller of a run. Expected failures (already running,
/// timeout, non-zero exit) are reported here, never as errors.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub state: RunState,
}

impl RunResult {
    fn already_running() -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some("already running".to_string()),
            state: RunState::Running,
        }
    }
}

/// Published when a run starts and when it finishes.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub job_id: String,
    pub status: RunState,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Everything the engine is built from.
pub struct EngineParts {
    pub tasks: Arc<dyn TaskStore>,
    pub signs: Arc<dyn SignTaskStore>,
    pub sign_history: Arc<dyn RunHistoryStore>,
    pub db_history: Arc<dyn RunHistoryStore>,
    pub scheduler: Arc<dyn CronScheduler>,
    pub invoker: Arc<dyn SignerInvoker>,
    pub config: EngineConfig,
}

/// Owns the run state of the process: guard, runner, history sinks and the
/// reconciler feeding the scheduler. Built once at startup and shared.
pub struct Engine {
    tasks: Arc<dyn TaskStore>,
    signs: Arc<dyn SignTaskStore>,
    sign_history: Arc<dyn RunHistoryStore>,
    db_history: Arc<dyn RunHistoryStore>,
    scheduler: Arc<dyn CronScheduler>,
    guard: ExecutionGuard,
    runner: ProcessRunner,
    reconciler: Reconciler,
    events: broadcast::Sender<RunEvent>,
    config: EngineConfig,
}

struct EngineLauncher(Weak<Engine>);

impl JobLauncher for EngineLauncher {
    fn callback(&self, key: JobKey) -> JobCallback {
        let engine = self.0.clone();
        Arc::new(move || {
            let engine = engine.clone();
            let key = key.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.fire(key).await;
                }
            }
            .boxed()
        })
    }
}

impl Engine {
    pub fn new(parts: EngineParts) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak| {
            let reconciler = Reconciler::new(
                parts.tasks.clone(),
                parts.signs.clone(),
                parts.scheduler.clone(),
                Arc::new(EngineLauncher(weak.clone())),
            );
            Engine {
                tasks: parts.tasks,
                signs: parts.signs,
                sign_history: parts.sign_history,
                db_history: parts.db_history,
                scheduler: parts.scheduler,
                guard: ExecutionGuard::new(
                    parts.config.live_buffer_lines,
                    parts.config.live_grace(),
                ),
                runner: ProcessRunner::new(parts.invoker, parts.config.run_timeout()),
                reconciler,
                events,
                config: parts.config,
            }
        })
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Brings the scheduler in line with both task stores.
    pub async fn sync(&self) -> SyncReport {
        self.reconciler.sync().await
    }

    /// Live job ids with their triggers.
    pub async fn schedule(&self) -> Vec<(String, String)> {
        let mut jobs = Vec::new();
        for job_id in self.scheduler.job_ids().await {
            if let Some(cron) = self.scheduler.trigger_of(&job_id).await {
                jobs.push((job_id, cron));
            }
        }
        jobs
    }

    /// Newest-first run records of a job, whether or not its task still
    /// exists.
    pub async fn history(&self, key: &JobKey) -> EngineResult<Vec<RunRecord>> {
        let store = match key {
            JobKey::Db(_) => &self.db_history,
            JobKey::Sign(_) => &self.sign_history,
        };
        store.list(key).await
    }

    fn history_for(&self, target: &RunTarget) -> &Arc<dyn RunHistoryStore> {
        match target {
            RunTarget::Db { .. } => &self.db_history,
            RunTarget::Sign { .. } => &self.sign_history,
        }
    }

    /// Supervises one run of `target`. Returns at once with `already running`
    /// when the job id is busy; nothing is spawned or queued in that case.
    pub async fn start(&self, target: RunTarget) -> RunResult {
        let job_id = target.job_id();
        let Some(permit) = self.guard.try_begin(&job_id) else {
            info!("{} is already running; trigger dropped", job_id);
            return RunResult::already_running();
        };

        let started_at = Utc::now();
        self.publish(RunEvent {
            job_id: job_id.clone(),
            status: RunState::Running,
            started_at: format_time(started_at),
            finished_at: None,
        });
        info!("Starting {}", target);

        let outcome = self.runner.run(&target, &permit).await;
        let finished_at = Utc::now();
        let success = outcome.state == RunState::Succeeded;

        let entry = HistoryEntry {
            record: RunRecord::at(
                finished_at,
                success,
                outcome.message.clone(),
                target.account(),
            ),
            state: outcome.state,
            output: outcome.output.clone(),
            started_at,
            finished_at,
        };
        if let Err(e) = self.history_for(&target).append(&target, &entry).await {
            warn!("Run history for {} not saved: {}", job_id, e);
        }
        permit.finish(outcome.state);

        self.publish(RunEvent {
            job_id: job_id.clone(),
            status: outcome.state,
            started_at: format_time(started_at),
            finished_at: Some(format_time(finished_at)),
        });
        if success {
            info!("{} succeeded", job_id);
        } else {
            warn!("{} failed: {}", job_id, outcome.message);
        }

        RunResult {
            success,
            output: outcome.output,
            error: (!success).then_some(outcome.message),
            state: outcome.state,
        }
    }

    /// Runs a job by id right away, whether or not it is enabled.
    pub async fn run_now(&self, job_id: &str) -> EngineResult<RunResult> {
        let key = JobKey::parse(job_id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown job id '{job_id}'")))?;
        let target = self
            .resolve(&key, false)
            .await?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        Ok(self.start(target).await)
    }

    /// Scheduler entry point. Tasks disabled or deleted since the last sync
    /// are skipped.
    async fn fire(&self, key: JobKey) {
        match self.resolve(&key, true).await {
            Ok(Some(target)) => {
                self.start(target).await;
            }
            Ok(None) => debug!("{} no longer runnable; skipped", key.job_id()),
            Err(e) => warn!("Cannot resolve {}: {}", key.job_id(), e),
        }
    }

    async fn resolve(&self, key: &JobKey, enabled_only: bool) -> EngineResult<Option<RunTarget>> {
        match key {
            JobKey::Db(id) => Ok(self
                .tasks
                .get(*id)
                .await?
                .filter(|task| task.enabled || !enabled_only)
                .map(|task| RunTarget::Db {
                    id: task.id,
                    name: task.name,
                    account: task.account_name,
                })),
            JobKey::Sign(name) => Ok(self
                .signs
                .list(false)
                .await?
                .into_iter()
                .filter(|sign| sign.enabled || !enabled_only)
                .find(|sign| &sign.name == name)
                .map(|sign| RunTarget::Sign {
                    name: sign.name,
                    account: sign.account_name,
                })),
        }
    }

    /// Periodically returns finished runs to idle once their grace period
    /// has passed. Stops when the engine is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let evicted = engine.guard.sweep(tokio::time::Instant::now());
                if evicted > 0 {
                    debug!("Evicted {} live buffers", evicted);
                }
            }
        })
    }

    fn publish(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::testing::ShellInvoker;
    use super::*;
    use crate::core::history::{FsRunHistory, SqliteRunHistory};
    use crate::core::scheduler::testing::RecordingScheduler;
    use crate::core::store::{Database, FsSignTaskStore, SqliteTaskStore};

    pub struct Harness {
        pub dir: tempfile::TempDir,
        pub db: Database,
        pub engine: Arc<Engine>,
        pub tasks: Arc<SqliteTaskStore>,
        pub signs: Arc<FsSignTaskStore>,
        pub sign_history: Arc<FsRunHistory>,
        pub scheduler: Arc<RecordingScheduler>,
        pub invoker: Arc<ShellInvoker>,
    }

    /// Engine over temp stores, a recording scheduler and `sh -c script`.
    pub async fn harness(script: &str, config: EngineConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let tasks = Arc::new(SqliteTaskStore::new(db.clone()));
        let signs = Arc::new(FsSignTaskStore::new(dir.path().join("signs")));
        let sign_history = Arc::new(FsRunHistory::new(
            dir.path().join("history"),
            signs.clone(),
            config.history_limit,
        ));
        let scheduler = RecordingScheduler::new();
        let invoker = ShellInvoker::new(script);
        let engine = Engine::new(EngineParts {
            tasks: tasks.clone(),
            signs: signs.clone(),
            sign_history: sign_history.clone(),
            db_history: Arc::new(SqliteRunHistory::new(
                db.clone(),
                dir.path().join("logs"),
                config.history_limit,
            )),
            scheduler: scheduler.clone(),
            invoker: invoker.clone(),
            config,
        });
        Harness {
            dir,
            db,
            engine,
            tasks,
            signs,
            sign_history,
            scheduler,
            invoker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{Harness, harness};
    use super::testing::ShellInvoker;
    use super::*;
    use crate::core::history::PruneReport;
    use crate::core::scheduler::testing::RecordingScheduler;
    use crate::core::store::types::{NewTask, SignTaskDraft, TaskPatch};
    use crate::core::store::{Database, FsSignTaskStore, SqliteTaskStore};
    use async_trait::async_trait;
    use std::time::Duration;

    fn daily() -> RunTarget {
        RunTarget::Sign {
            name: "daily-checkin".to_string(),
            account: "alice".to_string(),
        }
    }

    async fn create_daily(h: &Harness) {
        h.signs
            .create(SignTaskDraft {
                name: "daily-checkin".to_string(),
                account_name: "alice".to_string(),
                sign_at: "09:00".to_string(),
                random_seconds: 0,
                sign_interval: 1,
                chats: vec![],
                enabled: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_one_process() {
        let h = harness("sleep 0.3; echo done", EngineConfig::default()).await;
        create_daily(&h).await;

        let (a, b) = tokio::join!(h.engine.start(daily()), h.engine.start(daily()));
        let (winner, loser) = if a.success { (a, b) } else { (b, a) };
        assert!(winner.success);
        assert_eq!(winner.output, "done\n");
        assert!(!loser.success);
        assert_eq!(loser.error.as_deref(), Some("already running"));
        assert_eq!(h.invoker.count(), 1);
        assert!(!h.engine.guard().is_running("sign-daily-checkin"));
    }

    #[tokio::test]
    async fn timeout_is_recorded_and_releases_the_job() {
        let config = EngineConfig {
            run_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let h = harness("exec sleep 30", config).await;
        create_daily(&h).await;

        let begun = std::time::Instant::now();
        let result = h.engine.start(daily()).await;
        assert!(begun.elapsed() < Duration::from_secs(8));
        assert!(!result.success);
        assert_eq!(result.state, RunState::TimedOut);
        assert!(result.error.unwrap().starts_with("timed out"));
        assert!(!h.engine.guard().is_running("sign-daily-checkin"));

        let history = h
            .engine
            .history(&JobKey::Sign("daily-checkin".to_string()))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(history[0].message.starts_with("timed out"));
    }

    #[tokio::test]
    async fn scheduled_fire_runs_enabled_db_task_and_skips_disabled() {
        let h = harness("echo ok", EngineConfig::default()).await;
        let account = h.tasks.create_account("alice").await.unwrap();
        let task = h
            .tasks
            .create(NewTask {
                name: "checkin".to_string(),
                cron: "08:30".to_string(),
                account_id: account.id,
                enabled: true,
            })
            .await
            .unwrap();
        h.engine.sync().await;

        let job_id = format!("db-{}", task.id);
        assert!(h.scheduler.fire(&job_id).await);
        assert_eq!(h.invoker.count(), 1);
        assert_eq!(h.tasks.list_logs(task.id, 10).await.unwrap().len(), 1);

        h.tasks
            .update(
                task.id,
                TaskPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(h.scheduler.fire(&job_id).await);
        assert_eq!(h.invoker.count(), 1);

        let manual = h.engine.run_now(&job_id).await.unwrap();
        assert!(manual.success);
        assert_eq!(h.invoker.count(), 2);
    }

    #[tokio::test]
    async fn run_events_bracket_each_run() {
        let h = harness("echo hi", EngineConfig::default()).await;
        create_daily(&h).await;
        let mut events = h.engine.subscribe_runs();
        h.engine.start(daily()).await;

        let started = events.recv().await.unwrap();
        assert_eq!(started.status, RunState::Running);
        assert!(started.finished_at.is_none());
        let finished = events.recv().await.unwrap();
        assert_eq!(finished.job_id, "sign-daily-checkin");
        assert_eq!(finished.status, RunState::Succeeded);
        assert!(finished.finished_at.is_some());
    }

    struct BrokenHistory;

    #[async_trait]
    impl RunHistoryStore for BrokenHistory {
        async fn append(&self, _: &RunTarget, _: &HistoryEntry) -> EngineResult<()> {
            Err(EngineError::Io(std::io::Error::other("disk full")))
        }
        async fn list(&self, _: &JobKey) -> EngineResult<Vec<RunRecord>> {
            Ok(Vec::new())
        }
        async fn prune_older_than(&self, _: chrono::DateTime<Utc>) -> EngineResult<PruneReport> {
            Ok(PruneReport::default())
        }
    }

    #[tokio::test]
    async fn history_failure_does_not_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let engine = Engine::new(EngineParts {
            tasks: Arc::new(SqliteTaskStore::new(db)),
            signs: Arc::new(FsSignTaskStore::new(dir.path())),
            sign_history: Arc::new(BrokenHistory),
            db_history: Arc::new(BrokenHistory),
            scheduler: RecordingScheduler::new(),
            invoker: ShellInvoker::new("echo fine"),
            config: EngineConfig::default(),
        });
        let result = engine.start(daily()).await;
        assert!(result.success);
        assert_eq!(engine.guard().state("sign-daily-checkin"), RunState::Succeeded);
    }

    #[tokio::test]
    async fn run_now_rejects_unknown_ids() {
        let h = harness("true", EngineConfig::default()).await;
        assert!(matches!(
            h.engine.run_now("system-maintenance").await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            h.engine.run_now("sign-missing").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(h.dir.path().exists());
    }
}
