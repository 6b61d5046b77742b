//! Error taxonomy for the backup orchestrator core.

use thiserror::Error;

/// Coarse error kind surfaced to callers across the API boundary.
///
/// `CoreError::kind` maps every variant (including those nested in the
/// sub-enums below) onto one of these so that API-layer error responses
/// don't need a second, parallel classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    TaskRunning,
    ConnectionFailed,
    ExecutionError,
    DryRunError,
    Io,
    Cancelled,
}

/// Top-level error type for the core.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("task {0} is already running")]
    TaskRunning(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("dry run error: {0}")]
    DryRun(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// The coarse kind this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(e) => e.kind(),
            CoreError::History(e) => e.kind(),
            CoreError::Storage(e) => e.kind(),
            CoreError::Scheduler(e) => e.kind(),
            CoreError::TaskRunning(_) => ErrorKind::TaskRunning,
            CoreError::Execution(_) => ErrorKind::ExecutionError,
            CoreError::DryRun(_) => ErrorKind::DryRunError,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Config-store specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("backend {0} is in use by one or more tasks")]
    BackendInUse(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::NotFound(_) => ErrorKind::NotFound,
            ConfigError::Validation(_) => ErrorKind::Validation,
            ConfigError::BackendInUse(_) | ConfigError::DuplicateId(_) => ErrorKind::Conflict,
            ConfigError::Io(_) => ErrorKind::Io,
            ConfigError::Serialization(_) => ErrorKind::Validation,
        }
    }
}

/// History-store specific errors.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),
}

impl HistoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::NotFound(_) => ErrorKind::NotFound,
            HistoryError::Database(_) | HistoryError::Migration(_) => ErrorKind::Io,
        }
    }
}

/// Storage-backend specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("list failed: {0}")]
    ListFailed(String),

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Validation(_) => ErrorKind::Validation,
            StorageError::ConnectionFailed(_) | StorageError::AuthenticationFailed(_) => {
                ErrorKind::ConnectionFailed
            }
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::UploadFailed(_)
            | StorageError::DownloadFailed(_)
            | StorageError::ListFailed(_)
            | StorageError::DeleteFailed(_) => ErrorKind::ExecutionError,
            StorageError::Cancelled => ErrorKind::Cancelled,
            StorageError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Scheduler specific errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("task not scheduled: {0}")]
    NotScheduled(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidCron(_) => ErrorKind::Validation,
            SchedulerError::NotScheduled(_) => ErrorKind::NotFound,
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
