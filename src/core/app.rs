use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::core::config::Settings;
use crate::core::engine::{CliInvoker, Engine, EngineParts};
use crate::core::history::{FsRunHistory, SqliteRunHistory};
use crate::core::scheduler::TokioCronScheduler;
use crate::core::store::{AccessTokens, Database, FsSignTaskStore, SqliteTaskStore};

/// The wired-up process: stores, scheduler and engine built from one
/// `Settings`.
pub struct App {
    pub settings: Settings,
    pub tasks: Arc<SqliteTaskStore>,
    pub signs: Arc<FsSignTaskStore>,
    pub sign_history: Arc<FsRunHistory>,
    pub tokens: AccessTokens,
    pub scheduler: Arc<TokioCronScheduler>,
    pub engine: Arc<Engine>,
}

impl App {
    pub async fn bootstrap(settings: Settings) -> Result<Self> {
        settings.ensure_dirs()?;
        let timezone = settings.timezone()?;

        let db = Database::open(settings.db_path())
            .with_context(|| format!("opening {}", settings.db_path().display()))?;
        let tasks = Arc::new(SqliteTaskStore::new(db.clone()));
        let signs = Arc::new(FsSignTaskStore::new(settings.signs_dir()));
        let sign_history = Arc::new(FsRunHistory::new(
            settings.history_dir(),
            signs.clone(),
            settings.engine.history_limit,
        ));
        let db_history = Arc::new(SqliteRunHistory::new(
            db.clone(),
            settings.logs_dir(),
            settings.engine.history_limit,
        ));
        let scheduler = Arc::new(TokioCronScheduler::new(timezone).await?);
        let invoker = Arc::new(CliInvoker::new(
            settings.signer_bin.clone(),
            settings.signer_workdir(),
            settings.session_dir(),
            settings.telegram.clone(),
        ));

        let engine = Engine::new(EngineParts {
            tasks: tasks.clone(),
            signs: signs.clone(),
            sign_history: sign_history.clone(),
            db_history,
            scheduler: scheduler.clone(),
            invoker,
            config: settings.engine.clone(),
        });
        info!("Engine ready (data dir {})", settings.data_dir.display());

        Ok(Self {
            tokens: AccessTokens::new(db),
            settings,
            tasks,
            signs,
            sign_history,
            scheduler,
            engine,
        })
    }
}
