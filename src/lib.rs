//! # Taskvault
//!
//! A self-hosted backup orchestrator: watches declarative backup tasks, runs
//! them on a schedule or on demand, streams source trees to one or more
//! remote object stores either as a compressed archive or a file-by-file
//! sync, and records every run for audit, retry, and pruning.
//!
//! ## Architecture
//!
//! - `models`: value types and invariants for tasks, backends, executions,
//!   schedules, and options.
//! - `config`: atomic, validated persistence of the backend/task/settings
//!   document, plus the process-lifetime startup configuration layer.
//! - `history`: durable relational record of executions and per-backend
//!   upload rows.
//! - `storage`: the backend contract and the factory that builds concrete
//!   implementations (local filesystem, S3-compatible, GCS, Azure Blob, B2,
//!   Google Drive).
//! - `archive`: deterministic tar+gzip streaming with in-flight hashing.
//! - `sync`: local-tree/remote-listing diffing and the upload/delete planner.
//! - `executor`: orchestrates a single run end to end.
//! - `scheduler`: translates declarative schedules into a cron calendar and
//!   dispatches runs.
//!
//! The HTTP/JSON API surface, WebSocket fan-out transport, file browser,
//! static web UI, and CLI flag parsing are deliberately out of scope here;
//! this crate only promises the emit contract in [`executor::events`] and
//! the operations described in its module docs.

#![warn(clippy::all)]

pub mod archive;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use error::{CoreError, ErrorKind, Result};
pub use executor::Executor;
pub use scheduler::BackupScheduler;

use std::sync::Arc;

use config::{ConfigStore, ProcessConfig};
use history::HistoryStore;

/// Version of this crate, for diagnostics and health reporting.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The wired-together core: config store, history store, executor, and
/// scheduler, constructed from a [`ProcessConfig`].
///
/// Owns nothing related to the HTTP/WebSocket surface; callers in the API
/// layer hold this struct and drive it.
pub struct TaskVault {
    pub config: Arc<ConfigStore>,
    pub history: Arc<HistoryStore>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<BackupScheduler>,
}

impl TaskVault {
    /// Start-up contract: ensure `config/`, `temp/`, `sources/` exist under
    /// `process_config.root`, load or create the default config document,
    /// open the history store (running schema migrations), instantiate the
    /// executor, and start the scheduler.
    pub async fn bootstrap(process_config: &ProcessConfig) -> Result<Self> {
        let root = std::path::Path::new(&process_config.root);
        for dir in ["config", "temp", "sources"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }

        let config = Arc::new(
            ConfigStore::load_or_create_default(
                process_config.config_document_path(),
                root,
                "temp",
                "sources",
            )
            .await?,
        );

        let history = Arc::new(HistoryStore::connect(process_config.history_db_path()).await?);

        let executor = Arc::new(Executor::new(config.clone(), history.clone(), root.to_path_buf()).await);

        let scheduler = Arc::new(BackupScheduler::new(config.clone(), executor.clone()));
        scheduler.reload_schedules().await?;
        scheduler.start().await;

        tracing::info!(root = %root.display(), "taskvault bootstrapped");

        Ok(Self {
            config,
            history,
            executor,
            scheduler,
        })
    }

    /// Shutdown contract: stop the scheduler (halting new dispatches; any
    /// in-flight runs are left to the caller's own deadline handling) and
    /// close the history store's connection pool.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.history.close().await;
        tracing::info!("taskvault shut down");
    }
}

/// Commonly used types, re-exported for convenient `use taskvault::prelude::*`.
pub mod prelude {
    pub use crate::config::{ConfigStore, ProcessConfig};
    pub use crate::error::{CoreError, ErrorKind};
    pub use crate::executor::Executor;
    pub use crate::history::HistoryStore;
    pub use crate::models::{Backend, BackendKind, Execution, ExecutionStatus, Schedule, Task};
    pub use crate::scheduler::BackupScheduler;
    pub use crate::TaskVault;
}
