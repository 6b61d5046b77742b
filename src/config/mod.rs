//! Atomic, validated persistence of backends, tasks, and settings.
//!
//! Mirrors the teacher's separation between a process-lifetime,
//! env/file-driven configuration (`ProcessConfig`) and a domain document the
//! application mutates at runtime. The document here is hand-rolled JSON
//! (see `SPEC_FULL.md` §10) rather than layered through the `config` crate,
//! since its atomicity and validation rules are bespoke to this store.

mod process;

pub use process::ProcessConfig;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::models::{Backend, Settings, Task};

type Result<T> = std::result::Result<T, ConfigError>;

const CURRENT_VERSION: &str = "1.0";

/// The whole persisted document: backends, tasks, and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: String,
    pub backends: Vec<Backend>,
    pub tasks: Vec<Task>,
    pub settings: Settings,
}

impl ConfigDocument {
    fn new_default(temp_dir: impl Into<String>, sources_dir: impl Into<String>) -> Self {
        Self {
            version: CURRENT_VERSION.to_string(),
            backends: Vec::new(),
            tasks: Vec::new(),
            settings: Settings::new_default(temp_dir, sources_dir),
        }
    }

    /// Full-document validation: ID uniqueness plus referential integrity.
    fn validate(&self) -> Result<()> {
        let mut backend_ids = HashSet::new();
        for b in &self.backends {
            if b.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "backend name must not be empty".to_string(),
                ));
            }
            if !backend_ids.insert(b.id) {
                return Err(ConfigError::DuplicateId(b.id.to_string()));
            }
        }

        let mut task_ids = HashSet::new();
        for t in &self.tasks {
            t.validate_self().map_err(ConfigError::Validation)?;
            if !task_ids.insert(t.id) {
                return Err(ConfigError::DuplicateId(t.id.to_string()));
            }
            for backend_id in &t.backend_ids {
                if !backend_ids.contains(backend_id) {
                    return Err(ConfigError::Validation(format!(
                        "task {} references unknown backend {}",
                        t.id, backend_id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Atomic, validated, in-memory-cached persistence of the config document.
pub struct ConfigStore {
    path: PathBuf,
    root: PathBuf,
    doc: RwLock<ConfigDocument>,
}

impl ConfigStore {
    /// Load an existing document from `path`, or fail if it doesn't exist.
    pub async fn load(path: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path).await?;
        let doc: ConfigDocument = serde_json::from_slice(&bytes)?;
        doc.validate()?;
        Ok(Self {
            path,
            root: root.as_ref().to_path_buf(),
            doc: RwLock::new(doc),
        })
    }

    /// Load `path` if it exists, otherwise create and persist a fresh
    /// default document rooted at `temp_dir`/`sources_dir`.
    pub async fn load_or_create_default(
        path: impl AsRef<Path>,
        root: impl AsRef<Path>,
        temp_dir: impl Into<String>,
        sources_dir: impl Into<String>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Self::load(&path, root).await;
        }
        let doc = ConfigDocument::new_default(temp_dir, sources_dir);
        let store = Self {
            path,
            root: root.as_ref().to_path_buf(),
            doc: RwLock::new(doc),
        };
        store.persist_locked(&*store.doc.read().await).await?;
        Ok(store)
    }

    /// Resolve a possibly-relative path against the configured root.
    /// Absolute paths pass through unchanged.
    pub fn resolve_path(&self, p: &str) -> PathBuf {
        let candidate = Path::new(p);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    /// A defensive deep copy of the whole document.
    pub async fn get(&self) -> ConfigDocument {
        self.doc.read().await.clone()
    }

    pub async fn get_settings(&self) -> Settings {
        self.doc.read().await.settings.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.mutate(|doc| {
            doc.settings = settings;
            Ok(())
        })
        .await
    }

    // --- Backends ---------------------------------------------------

    pub async fn list_backends(&self) -> Vec<Backend> {
        self.doc.read().await.backends.clone()
    }

    pub async fn get_backend(&self, id: Uuid) -> Result<Backend> {
        self.doc
            .read()
            .await
            .backends
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))
    }

    pub async fn add_backend(&self, mut backend: Backend) -> Result<Backend> {
        if backend.id.is_nil() {
            backend.id = Uuid::new_v4();
        }
        let now = Utc::now();
        backend.created_at = now;
        backend.updated_at = now;
        let out = backend.clone();
        self.mutate(|doc| {
            doc.backends.push(backend);
            Ok(())
        })
        .await?;
        Ok(out)
    }

    pub async fn update_backend(&self, mut backend: Backend) -> Result<Backend> {
        backend.updated_at = Utc::now();
        let out = backend.clone();
        self.mutate(|doc| {
            let slot = doc
                .backends
                .iter_mut()
                .find(|b| b.id == backend.id)
                .ok_or_else(|| ConfigError::NotFound(backend.id.to_string()))?;
            *slot = backend;
            Ok(())
        })
        .await?;
        Ok(out)
    }

    pub async fn delete_backend(&self, id: Uuid) -> Result<()> {
        self.mutate(|doc| {
            if !doc.backends.iter().any(|b| b.id == id) {
                return Err(ConfigError::NotFound(id.to_string()));
            }
            if doc.tasks.iter().any(|t| t.backend_ids.contains(&id)) {
                return Err(ConfigError::BackendInUse(id.to_string()));
            }
            doc.backends.retain(|b| b.id != id);
            Ok(())
        })
        .await
    }

    // --- Tasks --------------------------------------------------------

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.doc.read().await.tasks.clone()
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.doc
            .read()
            .await
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))
    }

    pub async fn add_task(&self, mut task: Task) -> Result<Task> {
        if task.id.is_nil() {
            task.id = Uuid::new_v4();
        }
        let now = Utc::now();
        task.created_at = now;
        task.updated_at = now;
        let out = task.clone();
        self.mutate(|doc| {
            doc.tasks.push(task);
            Ok(())
        })
        .await?;
        Ok(out)
    }

    pub async fn update_task(&self, mut task: Task) -> Result<Task> {
        task.updated_at = Utc::now();
        let out = task.clone();
        self.mutate(|doc| {
            let slot = doc
                .tasks
                .iter_mut()
                .find(|t| t.id == task.id)
                .ok_or_else(|| ConfigError::NotFound(task.id.to_string()))?;
            *slot = task;
            Ok(())
        })
        .await?;
        Ok(out)
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.mutate(|doc| {
            if !doc.tasks.iter().any(|t| t.id == id) {
                return Err(ConfigError::NotFound(id.to_string()));
            }
            doc.tasks.retain(|t| t.id != id);
            Ok(())
        })
        .await
    }

    /// Update only the last/next run instants for a task, leaving
    /// everything else (and `updated_at`) untouched.
    pub async fn update_task_schedule(
        &self,
        id: Uuid,
        last_run: Option<chrono::DateTime<Utc>>,
        next_run: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let slot = doc
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;
            if last_run.is_some() {
                slot.last_run = last_run;
            }
            if next_run.is_some() {
                slot.next_run = next_run;
            }
            Ok(())
        })
        .await
    }

    // --- Persistence ----------------------------------------------------

    /// Run `f` against a clone of the document; on success, validate,
    /// persist, then commit the clone as the new in-memory state. On
    /// validation or I/O failure the in-memory state is left untouched.
    async fn mutate(&self, f: impl FnOnce(&mut ConfigDocument) -> Result<()>) -> Result<()> {
        let mut guard = self.doc.write().await;
        let mut candidate = guard.clone();
        f(&mut candidate)?;
        candidate.validate()?;
        self.persist_locked(&candidate).await?;
        *guard = candidate;
        Ok(())
    }

    async fn persist_locked(&self, doc: &ConfigDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchiveOptions, BackendKind, RetentionPolicy, Schedule};

    fn mk_backend(name: &str) -> Backend {
        let now = Utc::now();
        Backend {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: BackendKind::Local,
            config: Default::default(),
            enabled: true,
            created_at: now,
            updated_at: now,
            last_test_at: None,
            last_test_status: None,
        }
    }

    fn mk_task(name: &str, backend_ids: Vec<Uuid>) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            source_path: "/data".to_string(),
            backend_ids,
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

    #[tokio::test]
    async fn round_trip_preserves_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_create_default(&path, dir.path(), "temp", "sources")
            .await
            .unwrap();

        let backend = store.add_backend(mk_backend("local")).await.unwrap();
        store
            .add_task(mk_task("daily", vec![backend.id]))
            .await
            .unwrap();

        let reloaded = ConfigStore::load(&path, dir.path()).await.unwrap();
        let original = store.get().await;
        let again = reloaded.get().await;
        assert_eq!(original.backends.len(), again.backends.len());
        assert_eq!(original.tasks.len(), again.tasks.len());
        assert_eq!(original.tasks[0].name, again.tasks[0].name);
    }

    #[tokio::test]
    async fn deleting_in_use_backend_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_create_default(&path, dir.path(), "temp", "sources")
            .await
            .unwrap();
        let backend = store.add_backend(mk_backend("local")).await.unwrap();
        store
            .add_task(mk_task("daily", vec![backend.id]))
            .await
            .unwrap();

        let err = store.delete_backend(backend.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn adding_task_with_unknown_backend_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_create_default(&path, dir.path(), "temp", "sources")
            .await
            .unwrap();
        let err = store
            .add_task(mk_task("daily", vec![Uuid::new_v4()]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn mutating_a_returned_copy_does_not_corrupt_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_create_default(&path, dir.path(), "temp", "sources")
            .await
            .unwrap();
        store.add_backend(mk_backend("local")).await.unwrap();

        let mut copy = store.get().await;
        copy.backends.clear();
        copy.backends.push(mk_backend("intruder"));

        let still_intact = store.get().await;
        assert_eq!(still_intact.backends.len(), 1);
        assert_eq!(still_intact.backends[0].name, "local");
    }

    #[tokio::test]
    async fn resolve_path_joins_relative_against_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_or_create_default(&path, dir.path(), "temp", "sources")
            .await
            .unwrap();
        assert_eq!(store.resolve_path("sub/dir"), dir.path().join("sub/dir"));
        assert_eq!(store.resolve_path("/abs/path"), PathBuf::from("/abs/path"));
    }
}
