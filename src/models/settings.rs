//! Persisted, task/backend-adjacent settings.
//!
//! Distinct from `crate::config::ProcessConfig`, which is the env/file-driven
//! startup layer (root dir, port, log level) the process reads once at boot.

use serde::{Deserialize, Serialize};

/// Settings persisted inside the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub temp_dir: String,
    pub sources_dir: String,
    /// Advisory cap, enforced by the executor via a semaphore.
    pub max_concurrent_tasks: u32,
    pub log_level: String,
}

impl Settings {
    pub fn new_default(temp_dir: impl Into<String>, sources_dir: impl Into<String>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            sources_dir: sources_dir.into(),
            max_concurrent_tasks: 4,
            log_level: "info".to_string(),
        }
    }
}
