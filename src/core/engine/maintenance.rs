use chrono::{Duration, Utc};
use futures_util::FutureExt;
use std::sync::Arc;
use tracing::{info, warn};

use super::Engine;
use crate::core::error::EngineResult;
use crate::core::history::PruneReport;
use crate::core::scheduler::JobCallback;

/// Registered straight on the scheduler, outside the reconciled prefixes.
pub const MAINTENANCE_JOB_ID: &str = "system-maintenance";

impl Engine {
    /// Schedules the daily history prune under [`MAINTENANCE_JOB_ID`].
    pub async fn register_maintenance(self: &Arc<Self>) -> EngineResult<()> {
        let engine = Arc::downgrade(self);
        let callback: JobCallback = Arc::new(move || {
            let engine = engine.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.prune_history().await;
                }
            }
            .boxed()
        });
        self.scheduler
            .add(MAINTENANCE_JOB_ID, &self.config.maintenance_cron, callback)
            .await?;
        info!(
            "Maintenance scheduled at '{}' (retention {} days)",
            self.config.maintenance_cron, self.config.retention_days
        );
        Ok(())
    }

    /// Deletes run records and log files older than the retention window
    /// from both history stores. A failing store does not stop the other.
    pub async fn prune_history(&self) -> PruneReport {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days.max(0));
        let mut total = PruneReport::default();
        for (label, store) in [("task", &self.db_history), ("sign", &self.sign_history)] {
            match store.prune_older_than(cutoff).await {
                Ok(report) => {
                    info!(
                        "Maintenance: pruned {} {} records, {} files",
                        report.records, label, report.files
                    );
                    total += report;
                }
                Err(e) => warn!("Maintenance: {} history prune failed: {}", label, e),
            }
        }
        total
    }
}
