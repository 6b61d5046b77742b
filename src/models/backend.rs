//! Backend identity and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The kind of remote store a [`Backend`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    S3,
    Gcs,
    Gdrive,
    Azure,
    B2,
}

/// A configured destination that can store bytes under a remote path.
///
/// `config` is an opaque, kind-specific map (bucket, region, credentials,
/// storage tier, path prefix, ...). Secrets are stored in the clear here;
/// masking them on the wire is an API-layer concern, not this type's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: Uuid,
    pub name: String,
    pub kind: BackendKind,
    pub config: HashMap<String, serde_json::Value>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_test_at: Option<DateTime<Utc>>,
    pub last_test_status: Option<String>,
}

impl Backend {
    /// Look up a string-valued config key.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// The configured path prefix, if any, with trailing slashes trimmed.
    pub fn prefix(&self) -> Option<&str> {
        self.config_str("prefix")
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
    }

    /// Prepend this backend's configured prefix (if any) to a logical path.
    pub fn with_prefix(&self, logical_path: &str) -> String {
        match self.prefix() {
            Some(prefix) => format!("{prefix}/{logical_path}"),
            None => logical_path.to_string(),
        }
    }

    /// Strip this backend's configured prefix (if any) from a remote path,
    /// returning the logical path `List` should report.
    pub fn strip_prefix<'a>(&self, remote_path: &'a str) -> &'a str {
        match self.prefix() {
            Some(prefix) => remote_path
                .strip_prefix(prefix)
                .and_then(|s| s.strip_prefix('/'))
                .unwrap_or(remote_path),
            None => remote_path,
        }
    }
}
