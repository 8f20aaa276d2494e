use thiserror::Error;

/// Errors raised by the scheduling and execution engine and the stores
/// backing it. Expected run outcomes (already running, timeout) are not
/// errors; they travel as `RunResult` values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid trigger '{trigger}' for {task}: {reason}")]
    ScheduleValidation {
        task: String,
        trigger: String,
        reason: String,
    },

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<tokio_cron_scheduler::JobSchedulerError> for EngineError {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        EngineError::Scheduler(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
