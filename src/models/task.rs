//! Backup task definitions and their archive/sync options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::Schedule;

/// The artifact shape a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    #[serde(rename = "tar.gz")]
    TarGz,
    Sync,
}

impl Default for ArchiveFormat {
    fn default() -> Self {
        ArchiveFormat::TarGz
    }
}

/// Sync-mode specific behavior, embedded in [`ArchiveOptions`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    pub delete_remote: bool,
}

/// Archive/sync shaping options for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    pub format: ArchiveFormat,
    /// Informational when `format` is `sync`.
    pub compression: Option<String>,
    /// May reference `{task}` and `{timestamp}` placeholders.
    pub name_pattern: Option<String>,
    pub use_timestamp: bool,
    pub sync_options: SyncOptions,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::TarGz,
            compression: None,
            name_pattern: None,
            use_timestamp: true,
            sync_options: SyncOptions::default(),
        }
    }
}

/// Archive lifecycle policy. Applies only in archive mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// `0` means unlimited.
    pub keep_last: u32,
}

/// A declarative backup job: a source tree, a list of backend destinations,
/// a schedule, and archive/retention options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub source_path: String,
    pub backend_ids: Vec<Uuid>,
    pub schedule: Schedule,
    pub archive_options: ArchiveOptions,
    pub retention_policy: RetentionPolicy,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl Task {
    /// Validate the invariants this spec places directly on a task; does
    /// NOT check that `backend_ids` resolve to existing backends — that is
    /// a config-store-wide invariant checked against the full document.
    pub fn validate_self(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("task name must not be empty".to_string());
        }
        if self.source_path.trim().is_empty() {
            return Err("task source_path must not be empty".to_string());
        }
        if self.backend_ids.is_empty() {
            return Err("task must reference at least one backend".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.backend_ids {
            if !seen.insert(*id) {
                return Err(format!("duplicate backend id {id} in task backend_ids"));
            }
        }
        if let Schedule::Cron { cron_expr } = &self.schedule {
            if cron_expr.trim().is_empty() {
                return Err("cron schedule must have a non-empty cron_expr".to_string());
            }
        }
        Ok(())
    }

    /// Sanitize this task's name for use as an archive/remote filename
    /// component. Result always matches `[a-z0-9._-]+`. Idempotent:
    /// `sanitize(sanitize(x)) == sanitize(x)`.
    pub fn sanitized_name(&self) -> String {
        sanitize_name(&self.name)
    }
}

/// Sanitize an arbitrary name for use as a filename component: spaces
/// become `-`, the rest is lowercased, and anything outside
/// `[a-z0-9._-]` is dropped rather than merely blacklisted, so the
/// result always matches that set regardless of script or punctuation.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .collect::<String>()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_idempotent() {
        let raw = "Daily DB Backup: prod/staging";
        let once = sanitize_name(raw);
        let twice = sanitize_name(&once);
        assert_eq!(once, twice);
        assert!(once.chars().all(|c| c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '.'
            || c == '_'
            || c == '-'));
    }

    #[test]
    fn sanitize_drops_everything_outside_the_allowed_set() {
        let cases = ["task#1!", "Café Müller", "日本語タスク", "  ", "a/b\\c:d*e?f\"g<h>i|j"];
        for raw in cases {
            let sanitized = sanitize_name(raw);
            assert!(
                sanitized.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
                "sanitize_name({raw:?}) produced {sanitized:?}, outside [a-z0-9._-]"
            );
        }
    }

    #[test]
    fn validate_self_rejects_empty_cron_expr() {
        let mut t = sample_task();
        t.schedule = Schedule::Cron { cron_expr: "   ".to_string() };
        assert!(t.validate_self().is_err());
    }

    #[test]
    fn validate_self_rejects_empty_name() {
        let t = sample_task();
        let mut bad = t.clone();
        bad.name = "   ".to_string();
        assert!(bad.validate_self().is_err());
    }

    #[test]
    fn validate_self_rejects_duplicate_backend_ids() {
        let mut t = sample_task();
        let id = Uuid::new_v4();
        t.backend_ids = vec![id, id];
        assert!(t.validate_self().is_err());
    }

    #[test]
    fn validate_self_rejects_no_backends() {
        let mut t = sample_task();
        t.backend_ids.clear();
        assert!(t.validate_self().is_err());
    }

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            name: "daily-db".to_string(),
            description: String::new(),
            source_path: "/data/db".to_string(),
            backend_ids: vec![Uuid::new_v4()],
            schedule: Schedule::Manual,
            archive_options: ArchiveOptions::default(),
            retention_policy: RetentionPolicy::default(),
            enabled: true,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run: None,
        }
    }
}
