use async_trait::async_trait;
use chrono_tz::Tz;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::engine::trigger;
use crate::core::error::{EngineError, EngineResult};

/// What a job does when it fires. Invoked once per due time.
pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cron scheduler keyed by string job ids. Triggers are 5-field cron
/// expressions.
#[async_trait]
pub trait CronScheduler: Send + Sync {
    async fn job_ids(&self) -> Vec<String>;

    async fn trigger_of(&self, job_id: &str) -> Option<String>;

    /// Registers `job_id`, replacing any job already under that id.
    async fn add(&self, job_id: &str, cron: &str, callback: JobCallback) -> EngineResult<()>;

    /// Moves an existing job to a new trigger, keeping its id and callback.
    async fn reschedule(&self, job_id: &str, cron: &str) -> EngineResult<()>;

    async fn remove(&self, job_id: &str) -> EngineResult<bool>;
}

struct Registered {
    uuid: Uuid,
    cron: String,
    callback: JobCallback,
}

/// `tokio-cron-scheduler` behind [`CronScheduler`]. Jobs fire in `timezone`.
pub struct TokioCronScheduler {
    inner: JobScheduler,
    timezone: Tz,
    jobs: Mutex<HashMap<String, Registered>>,
}

impl TokioCronScheduler {
    pub async fn new(timezone: Tz) -> EngineResult<Self> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            timezone,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start(&self) -> EngineResult<()> {
        self.inner.start().await?;
        info!("Cron scheduler started ({})", self.timezone);
        Ok(())
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        let mut inner = self.inner.clone();
        inner.shutdown().await?;
        info!("Cron scheduler stopped");
        Ok(())
    }

    fn build(&self, job_id: &str, cron: &str, callback: JobCallback) -> EngineResult<Job> {
        let invalid = |reason: String| EngineError::ScheduleValidation {
            task: job_id.to_string(),
            trigger: cron.to_string(),
            reason,
        };
        let expr = trigger::with_seconds(cron).map_err(|e| invalid(e.to_string()))?;
        Job::new_async_tz(expr.as_str(), self.timezone, move |_uuid, _l| {
            let callback = callback.clone();
            Box::pin(async move {
                tokio::spawn(callback());
            })
        })
        .map_err(|e| invalid(e.to_string()))
    }
}

#[async_trait]
impl CronScheduler for TokioCronScheduler {
    async fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn trigger_of(&self, job_id: &str) -> Option<String> {
        self.jobs.lock().await.get(job_id).map(|r| r.cron.clone())
    }

    async fn add(&self, job_id: &str, cron: &str, callback: JobCallback) -> EngineResult<()> {
        let job = self.build(job_id, cron, callback.clone())?;
        let mut jobs = self.jobs.lock().await;
        let uuid = self.inner.add(job).await?;
        if let Some(previous) = jobs.insert(
            job_id.to_string(),
            Registered {
                uuid,
                cron: cron.to_string(),
                callback,
            },
        ) {
            self.inner.remove(&previous.uuid).await?;
        }
        debug!("Scheduled {} at '{}'", job_id, cron);
        Ok(())
    }

    async fn reschedule(&self, job_id: &str, cron: &str) -> EngineResult<()> {
        let mut jobs = self.jobs.lock().await;
        let Some(current) = jobs.get_mut(job_id) else {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        };
        if current.cron == cron {
            return Ok(());
        }
        // Build first so a bad trigger leaves the old job running.
        let job = self.build(job_id, cron, current.callback.clone())?;
        let uuid = self.inner.add(job).await?;
        self.inner.remove(&current.uuid).await?;
        current.uuid = uuid;
        current.cron = cron.to_string();
        debug!("Rescheduled {} to '{}'", job_id, cron);
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> EngineResult<bool> {
        let Some(registered) = self.jobs.lock().await.remove(job_id) else {
            return Ok(false);
        };
        self.inner.remove(&registered.uuid).await?;
        debug!("Unscheduled {}", job_id);
        Ok(true)
    }
}
