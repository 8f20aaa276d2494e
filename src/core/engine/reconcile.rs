use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::target::{DB_PREFIX, JobKey, SIGN_PREFIX, is_managed};
use super::trigger::to_cron;
use crate::core::error::EngineError;
use crate::core::scheduler::{CronScheduler, JobCallback};
use crate::core::store::{SignTaskStore, TaskStore};

/// Produces the callback a scheduled job runs when it comes due.
pub trait JobLauncher: Send + Sync {
    fn callback(&self, key: JobKey) -> JobCallback;
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub rescheduled: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<String>,
}

impl SyncReport {
    /// True when the scheduler was not touched.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.rescheduled.is_empty() && self.removed.is_empty()
    }
}

/// Keeps the scheduler's `db-*` and `sign-*` jobs equal to the enabled tasks
/// of both stores. Jobs outside those prefixes are never touched.
pub struct Reconciler {
    tasks: Arc<dyn TaskStore>,
    signs: Arc<dyn SignTaskStore>,
    scheduler: Arc<dyn CronScheduler>,
    launcher: Arc<dyn JobLauncher>,
    sync_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        signs: Arc<dyn SignTaskStore>,
        scheduler: Arc<dyn CronScheduler>,
        launcher: Arc<dyn JobLauncher>,
    ) -> Self {
        Self {
            tasks,
            signs,
            scheduler,
            launcher,
            sync_lock: Mutex::new(()),
        }
    }

    pub async fn sync(&self) -> SyncReport {
        let _serialized = self.sync_lock.lock().await;
        let mut report = SyncReport::default();
        let mut desired: BTreeMap<String, (JobKey, String)> = BTreeMap::new();
        // Ids whose task exists but could not be (re)scheduled; their live
        // job, if any, is left alone.
        let mut keep: HashSet<String> = HashSet::new();
        let mut frozen_prefixes: Vec<&'static str> = Vec::new();

        match self.tasks.list_enabled().await {
            Ok(tasks) => {
                for task in tasks {
                    let job_id = JobKey::Db(task.id).job_id();
                    match to_cron(&task.cron) {
                        Ok(cron) => {
                            desired.insert(job_id, (JobKey::Db(task.id), cron));
                        }
                        Err(e) => {
                            let err = EngineError::ScheduleValidation {
                                task: job_id.clone(),
                                trigger: task.cron.clone(),
                                reason: e.to_string(),
                            };
                            warn!("Skipping task '{}': {}", task.name, err);
                            report.failed.push(job_id.clone());
                            keep.insert(job_id);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Cannot list tasks, keeping their jobs as they are: {}", e);
                frozen_prefixes.push(DB_PREFIX);
            }
        }

        match self.signs.list(false).await {
            Ok(signs) => {
                for sign in signs.into_iter().filter(|s| s.enabled) {
                    let key = JobKey::Sign(sign.name.clone());
                    let job_id = key.job_id();
                    if desired.contains_key(&job_id) || keep.contains(&job_id) {
                        warn!(
                            "Sign task '{}' of {} shares job id {} with another account; not scheduled",
                            sign.name, sign.account_name, job_id
                        );
                        continue;
                    }
                    match to_cron(sign.trigger()) {
                        Ok(cron) => {
                            desired.insert(job_id, (key, cron));
                        }
                        Err(e) => {
                            let err = EngineError::ScheduleValidation {
                                task: job_id.clone(),
                                trigger: sign.sign_at.clone(),
                                reason: e.to_string(),
                            };
                            warn!("Skipping sign task '{}': {}", sign.name, err);
                            report.failed.push(job_id.clone());
                            keep.insert(job_id);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Cannot list sign tasks, keeping their jobs as they are: {}", e);
                frozen_prefixes.push(SIGN_PREFIX);
            }
        }

        let existing: HashSet<String> = self
            .scheduler
            .job_ids()
            .await
            .into_iter()
            .filter(|id| is_managed(id))
            .collect();

        for (job_id, (key, cron)) in &desired {
            if existing.contains(job_id) {
                if self.scheduler.trigger_of(job_id).await.as_deref() == Some(cron.as_str()) {
                    report.unchanged += 1;
                    continue;
                }
                match self.scheduler.reschedule(job_id, cron).await {
                    Ok(()) => report.rescheduled.push(job_id.clone()),
                    Err(e) => {
                        warn!("Failed to reschedule {}: {}", job_id, e);
                        report.failed.push(job_id.clone());
                    }
                }
            } else {
                let callback = self.launcher.callback(key.clone());
                match self.scheduler.add(job_id, cron, callback).await {
                    Ok(()) => report.added.push(job_id.clone()),
                    Err(e) => {
                        warn!("Failed to schedule {}: {}", job_id, e);
                        report.failed.push(job_id.clone());
                    }
                }
            }
        }

        let mut stale: Vec<&String> = existing
            .iter()
            .filter(|id| !desired.contains_key(*id) && !keep.contains(*id))
            .filter(|id| !frozen_prefixes.iter().any(|p| id.starts_with(p)))
            .collect();
        stale.sort();
        for job_id in stale {
            match self.scheduler.remove(job_id).await {
                Ok(_) => report.removed.push(job_id.clone()),
                Err(e) => {
                    warn!("Failed to unschedule {}: {}", job_id, e);
                    report.failed.push(job_id.clone());
                }
            }
        }

        if report.is_noop() && report.failed.is_empty() {
            info!("Schedule in sync ({} jobs)", report.unchanged);
        } else {
            info!(
                "Schedule synced: {} added, {} rescheduled, {} removed, {} unchanged, {} failed",
                report.added.len(),
                report.rescheduled.len(),
                report.removed.len(),
                report.unchanged,
                report.failed.len()
            );
        }
        report
    }
}
