//! Task execution: the component that actually runs a [`Task`] once,
//! fanning out to its backends and recording the result.
//!
//! Grounded on the teacher's `backup::BackupOrchestrator`: a struct
//! composing the config store, history store, and storage factory behind
//! `Arc`s, with a single entry point per unit of work and an aggregate
//! status computed from its sub-results. The running-task map and
//! concurrency cap follow the `Arc<RwLock<...>>` idiom the teacher's
//! `BackupScheduler` uses for its own schedule/execution maps. Every field
//! on [`Executor`] is itself cheaply cloneable (`Arc`s, a `PathBuf`, a
//! `Clone` event bus), so `execute` can hand a clone of `self` to a spawned
//! task and return the execution's identity to its caller immediately,
//! matching the "kick the body off asynchronously" dispatch contract.

pub mod events;

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{archive_file_name, build_archive, ArchiveProgressCallback};
use crate::config::ConfigStore;
use crate::error::CoreError;
use crate::history::HistoryStore;
use crate::models::{
    ArchiveFormat, BackendResult, BackendResultStatus, Execution, ExecutionStatus, Task,
};
use crate::storage::{self, RemoteObject};
use crate::sync::{execute_sync, plan_sync, scan_local_tree};
use events::{progress_percent, EventBus, ExecutionEvent, SyncPhase};

type Result<T> = std::result::Result<T, CoreError>;

/// Plan for one task run, computed without performing any writes.
#[derive(Debug, Clone)]
pub struct DryRunBackendPlan {
    pub backend_id: Uuid,
    pub backend_name: String,
    pub uploads: Vec<String>,
    pub deletes: Vec<String>,
    /// Whether `Test()` currently succeeds for this backend.
    pub test_passed: bool,
}

/// A source-tree census taken for a dry run, independent of archive/sync
/// mode: total files and bytes, directory count, and the largest entries.
#[derive(Debug, Clone, Default)]
pub struct FilesSummary {
    pub total_files: u64,
    pub total_size: u64,
    pub total_dirs: u64,
    pub largest_file: Option<(String, u64)>,
    pub top_10_largest: Vec<(String, u64)>,
    pub extension_histogram: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub task_id: Uuid,
    pub mode: ArchiveFormat,
    pub files_summary: FilesSummary,
    /// Archive mode only: the file name that would be produced, and the
    /// estimated post-compression size (`total_size * 0.7` for gzip,
    /// `total_size * 1.0` for no compression).
    pub estimated_archive_name: Option<String>,
    pub estimated_archive_size: Option<u64>,
    pub per_backend: Vec<DryRunBackendPlan>,
}

struct ArchiveOutcome {
    archive_size: Option<u64>,
    archive_hash: Option<String>,
    backend_results: Vec<BackendResult>,
}

#[derive(Clone)]
struct RunHandle {
    execution_id: Uuid,
    cancel: CancellationToken,
}

/// Runs tasks: archives or syncs a source tree out to every configured
/// backend, records history, applies retention, and publishes progress.
///
/// Cheaply `Clone`: every field is an `Arc`, a `PathBuf`, or already
/// `Clone` (the event bus), so a running task can own its own copy rather
/// than borrowing `&self` across an `.await` that outlives the caller.
#[derive(Clone)]
pub struct Executor {
    config: Arc<ConfigStore>,
    history: Arc<HistoryStore>,
    root: PathBuf,
    running: Arc<RwLock<HashMap<Uuid, RunHandle>>>,
    semaphore: Option<Arc<Semaphore>>,
    events: EventBus,
}

impl Executor {
    pub async fn new(config: Arc<ConfigStore>, history: Arc<HistoryStore>, root: PathBuf) -> Self {
        let max = config.get_settings().await.max_concurrent_tasks;
        let semaphore = if max == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(max as usize)))
        };
        Self {
            config,
            history,
            root,
            running: Arc::new(RwLock::new(HashMap::new())),
            semaphore,
            events: EventBus::default(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Request cancellation of the execution currently in flight for
    /// `execution_id`. A no-op (but not an error) if nothing matches —
    /// the run may already have finished.
    pub async fn cancel(&self, execution_id: Uuid) {
        if let Some(handle) = self
            .running
            .read()
            .await
            .values()
            .find(|h| h.execution_id == execution_id)
        {
            handle.cancel.cancel();
        }
    }

    pub async fn is_running(&self, task_id: Uuid) -> bool {
        self.running.read().await.contains_key(&task_id)
    }

    /// Run `task_id` once. Fails fast with [`CoreError::TaskRunning`] if
    /// it's already in flight, or with [`CoreError::Execution`] if the
    /// task is disabled. Creates the execution row, publishes
    /// `execution_started`, and hands the run's body to a spawned task —
    /// the returned [`Execution`] reflects the freshly-created `running`
    /// row, not the run's eventual outcome.
    pub async fn execute(&self, task_id: Uuid) -> Result<Execution> {
        let task = self.config.get_task(task_id).await?;
        if !task.enabled {
            return Err(CoreError::Execution(format!("task {task_id} is disabled")));
        }

        {
            let running = self.running.read().await;
            if running.contains_key(&task_id) {
                return Err(CoreError::TaskRunning(task_id.to_string()));
            }
        }

        let cancel = CancellationToken::new();
        let execution = Execution::new_running(task.id, task.name.clone());
        self.history.create(&execution).await?;
        self.running.write().await.insert(
            task_id,
            RunHandle {
                execution_id: execution.id,
                cancel: cancel.clone(),
            },
        );
        self.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id: execution.id,
            task_id: task.id,
            task_name: task.name.clone(),
            started_at: execution.started_at,
        });
        tracing::info!(execution_id = %execution.id, task_id = %task.id, "execution started");

        let this = self.clone();
        let execution_id = execution.id;
        tokio::spawn(async move {
            this.run_task_body(task, execution_id, cancel).await;
        });

        Ok(execution)
    }

    /// Compute what `execute` would do, without writing, uploading, or
    /// deleting anything: a fresh source-tree census plus, per backend,
    /// the planned uploads/deletes and whether it currently passes `Test()`.
    pub async fn execute_dry_run(&self, task_id: Uuid) -> Result<DryRunReport> {
        let task = self.config.get_task(task_id).await?;
        let source_path = self.config.resolve_path(&task.source_path);
        let files_summary = summarize_source_tree(&source_path)?;

        let (estimated_archive_name, estimated_archive_size) = match task.archive_options.format {
            ArchiveFormat::TarGz => {
                let factor = match task.archive_options.compression.as_deref() {
                    Some("none") => 1.0,
                    _ => 0.7,
                };
                (
                    Some(archive_file_name(&task, &task.archive_options)),
                    Some((files_summary.total_size as f64 * factor) as u64),
                )
            }
            ArchiveFormat::Sync => (None, None),
        };

        let mut per_backend = Vec::new();
        for backend_id in &task.backend_ids {
            let backend = self.config.get_backend(*backend_id).await?;
            let storage = storage::create_backend(&backend, &self.root)?;
            let test_passed = storage.test_connection().await.is_ok();

            match task.archive_options.format {
                ArchiveFormat::TarGz => {
                    per_backend.push(DryRunBackendPlan {
                        backend_id: backend.id,
                        backend_name: backend.name.clone(),
                        uploads: vec![estimated_archive_name.clone().unwrap_or_default()],
                        deletes: Vec::new(),
                        test_passed,
                    });
                }
                ArchiveFormat::Sync => {
                    let local = scan_local_tree(&source_path)?;
                    let prefix = task.sanitized_name();
                    let remote = storage
                        .list(&prefix, CancellationToken::new())
                        .await
                        .map_err(CoreError::from)?;
                    let plan = plan_sync(&local, &remote, task.archive_options.sync_options.delete_remote);
                    per_backend.push(DryRunBackendPlan {
                        backend_id: backend.id,
                        backend_name: backend.name.clone(),
                        uploads: plan.to_upload.into_iter().map(|e| e.relative_path).collect(),
                        deletes: plan.to_delete,
                        test_passed,
                    });
                }
            }
        }

        Ok(DryRunReport {
            task_id,
            mode: task.archive_options.format,
            files_summary,
            estimated_archive_name,
            estimated_archive_size,
            per_backend,
        })
    }

    /// The spawned body of a run: select archive/sync mode, drive it to
    /// completion, roll up per-backend status, finalize the execution row,
    /// and clear the running-map entry on every exit path.
    async fn run_task_body(&self, task: Task, execution_id: Uuid, cancel: CancellationToken) {
        let _permit = match &self.semaphore {
            Some(sem) => match sem.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => None,
            },
            None => None,
        };

        let mut execution = match self.history.get(execution_id).await {
            Ok(e) => e,
            Err(_) => Execution::new_running(task.id, task.name.clone()),
        };

        let outcome = match task.archive_options.format {
            ArchiveFormat::TarGz => self.run_archive(&task, execution_id, cancel).await,
            ArchiveFormat::Sync => self.run_sync(&task, execution_id, cancel).await,
        };

        match outcome {
            Ok(result) => {
                for br in &result.backend_results {
                    let _ = self.history.add_backend_upload(execution_id, br).await;
                }

                let succeeded = result
                    .backend_results
                    .iter()
                    .filter(|r| r.status == BackendResultStatus::Success)
                    .count();
                let failed = result.backend_results.len() - succeeded;
                let total = result.backend_results.len();

                let (status, error_message) = if failed == 0 {
                    (ExecutionStatus::Success, None)
                } else if succeeded == 0 {
                    let detail = failed_backend_summary(&result.backend_results);
                    (
                        ExecutionStatus::Failed,
                        Some(format!("All backend uploads failed: {detail}")),
                    )
                } else {
                    let detail = failed_backend_summary(&result.backend_results);
                    (
                        ExecutionStatus::Success,
                        Some(format!("{failed} of {total} backends failed: {detail}")),
                    )
                };

                execution.archive_size = result.archive_size;
                execution.archive_hash = result.archive_hash;
                execution.backend_results = result.backend_results;
                execution.finish(status, error_message.clone());
                let _ = self.history.update(&execution).await;
                let _ = self
                    .config
                    .update_task_schedule(task.id, Some(Utc::now()), None)
                    .await;

                if status != ExecutionStatus::Failed {
                    self.apply_retention(&task).await;
                }

                tracing::info!(
                    execution_id = %execution_id,
                    task_id = %task.id,
                    status = status.as_str(),
                    "execution finished"
                );

                if status == ExecutionStatus::Failed {
                    self.events.publish(ExecutionEvent::ExecutionFailed {
                        execution_id,
                        task_id: task.id,
                        status,
                        completed_at: execution.completed_at.unwrap_or_else(Utc::now),
                        error_message: error_message.unwrap_or_default(),
                    });
                } else {
                    self.events.publish(ExecutionEvent::ExecutionCompleted {
                        execution_id,
                        task_id: task.id,
                        status,
                        completed_at: execution.completed_at.unwrap_or_else(Utc::now),
                        duration_ms: execution.duration_ms.unwrap_or(0),
                        archive_size: execution.archive_size,
                        backends_succeeded: succeeded as u32,
                        backends_failed: failed as u32,
                    });
                }
            }
            Err(e) => {
                let status = if matches!(e, CoreError::Cancelled(_)) {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                execution.finish(status, Some(e.to_string()));
                let _ = self.history.update(&execution).await;
                tracing::warn!(execution_id = %execution_id, error = %e, "execution failed");
                self.events.publish(ExecutionEvent::ExecutionFailed {
                    execution_id,
                    task_id: task.id,
                    status,
                    completed_at: execution.completed_at.unwrap_or_else(Utc::now),
                    error_message: e.to_string(),
                });
            }
        }

        self.running.write().await.remove(&task.id);
    }

    async fn run_archive(
        &self,
        task: &Task,
        execution_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ArchiveOutcome> {
        let source_path = self.config.resolve_path(&task.source_path);
        let temp_dir = self.config.resolve_path(&self.config.get_settings().await.temp_dir);
        let archive_name = archive_file_name(task, &task.archive_options);
        let archive_path = temp_dir.join(&archive_name);

        let events = self.events.clone();
        let progress: ArchiveProgressCallback = Arc::new(move |bytes, total, current_file| {
            events.publish(ExecutionEvent::ArchiveProgress {
                execution_id,
                progress_percent: progress_percent(bytes, total),
                current_file: current_file.to_string(),
                bytes_processed: bytes,
                bytes_total: total,
            });
        });

        let built_result =
            build_archive(&source_path, &archive_path, cancel.clone(), Some(progress)).await;
        let built = match built_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tokio::fs::remove_file(&archive_path).await;
                return Err(e);
            }
        };

        let mut backend_results = Vec::new();
        for backend_id in &task.backend_ids {
            if cancel.is_cancelled() {
                let _ = tokio::fs::remove_file(&built.path).await;
                return Err(CoreError::Cancelled(task.id.to_string()));
            }
            let backend = self.config.get_backend(*backend_id).await?;
            let storage = storage::create_backend(&backend, &self.root)?;
            if let Err(e) = storage.initialize().await {
                backend_results.push(BackendResult {
                    backend_id: backend.id,
                    backend_name: backend.name.clone(),
                    status: BackendResultStatus::Failed,
                    uploaded_at: Utc::now(),
                    size: 0,
                    remote_path: String::new(),
                    error_message: Some(e.to_string()),
                });
                continue;
            }

            let remote_path = format!("{}/{}", task.sanitized_name(), archive_name);
            let events = self.events.clone();
            let backend_id_for_cb = backend.id;
            let backend_name_for_cb = backend.name.clone();
            let progress_cb: storage::ProgressCallback = Arc::new(move |bytes, total| {
                events.publish(ExecutionEvent::UploadProgress {
                    execution_id,
                    backend_id: backend_id_for_cb,
                    backend_name: backend_name_for_cb.clone(),
                    progress_percent: progress_percent(bytes, total),
                    bytes_uploaded: bytes,
                    bytes_total: total,
                });
            });

            let result = storage
                .upload(&built.path, &remote_path, cancel.clone(), Some(progress_cb))
                .await;

            backend_results.push(match result {
                Ok(uploaded) => BackendResult {
                    backend_id: backend.id,
                    backend_name: backend.name.clone(),
                    status: BackendResultStatus::Success,
                    uploaded_at: Utc::now(),
                    size: uploaded.size,
                    remote_path: uploaded.remote_path,
                    error_message: None,
                },
                Err(e) => BackendResult {
                    backend_id: backend.id,
                    backend_name: backend.name.clone(),
                    status: BackendResultStatus::Failed,
                    uploaded_at: Utc::now(),
                    size: 0,
                    remote_path,
                    error_message: Some(e.to_string()),
                },
            });
            let _ = storage.close().await;
        }

        let _ = tokio::fs::remove_file(&built.path).await;

        Ok(ArchiveOutcome {
            archive_size: Some(built.size),
            archive_hash: Some(built.hash),
            backend_results,
        })
    }

    async fn run_sync(
        &self,
        task: &Task,
        execution_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ArchiveOutcome> {
        let source_path = self.config.resolve_path(&task.source_path);
        let prefix = task.sanitized_name();

        let mut backend_results = Vec::new();
        let mut total_bytes: u64 = 0;

        for backend_id in &task.backend_ids {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled(task.id.to_string()));
            }
            let backend = self.config.get_backend(*backend_id).await?;
            let storage = storage::create_backend(&backend, &self.root)?;
            storage.initialize().await.map_err(CoreError::from).ok();

            self.events.publish(ExecutionEvent::SyncProgress {
                execution_id,
                backend_id: backend.id,
                backend_name: backend.name.clone(),
                phase: SyncPhase::ScanningLocal,
                progress_percent: 0,
                current_file: String::new(),
                files_processed: 0,
                files_total: 0,
            });
            let local = scan_local_tree(&source_path)?;

            self.events.publish(ExecutionEvent::SyncProgress {
                execution_id,
                backend_id: backend.id,
                backend_name: backend.name.clone(),
                phase: SyncPhase::ListingRemote,
                progress_percent: 0,
                current_file: String::new(),
                files_processed: 0,
                files_total: 0,
            });
            let remote: Vec<RemoteObject> = storage
                .list(&prefix, cancel.clone())
                .await
                .map_err(CoreError::from)?;
            let plan = plan_sync(&local, &remote, task.archive_options.sync_options.delete_remote);
            let planned_uploads = plan.to_upload.len() as u64;
            let planned_deletes = plan.to_delete.len() as u64;

            let events = self.events.clone();
            let backend_id_for_cb = backend.id;
            let backend_name_for_cb = backend.name.clone();
            let done = Arc::new(std::sync::atomic::AtomicU64::new(0));
            let done_for_cb = done.clone();
            let progress: storage::ProgressCallback = Arc::new(move |_bytes, _total| {
                let n = done_for_cb.load(std::sync::atomic::Ordering::Relaxed);
                events.publish(ExecutionEvent::SyncProgress {
                    execution_id,
                    backend_id: backend_id_for_cb,
                    backend_name: backend_name_for_cb.clone(),
                    phase: SyncPhase::Syncing,
                    progress_percent: progress_percent(n, planned_uploads),
                    current_file: String::new(),
                    files_processed: n,
                    files_total: planned_uploads,
                });
            });

            let summary =
                execute_sync(&plan, storage.as_ref(), &prefix, false, cancel.clone(), Some(progress)).await;
            total_bytes += summary.bytes_uploaded;
            let _ = storage.close().await;

            if planned_deletes > 0 {
                self.events.publish(ExecutionEvent::SyncProgress {
                    execution_id,
                    backend_id: backend.id,
                    backend_name: backend.name.clone(),
                    phase: SyncPhase::Deleting,
                    progress_percent: 100,
                    current_file: String::new(),
                    files_processed: planned_deletes,
                    files_total: planned_deletes,
                });
            }
            self.events.publish(ExecutionEvent::SyncProgress {
                execution_id,
                backend_id: backend.id,
                backend_name: backend.name.clone(),
                phase: SyncPhase::Completed,
                progress_percent: 100,
                current_file: String::new(),
                files_processed: planned_uploads,
                files_total: planned_uploads,
            });

            let failed: Vec<&str> = summary
                .uploaded
                .iter()
                .chain(summary.deleted.iter())
                .filter_map(|r| r.error.as_deref())
                .collect();

            backend_results.push(BackendResult {
                backend_id: backend.id,
                backend_name: backend.name.clone(),
                status: if failed.is_empty() {
                    BackendResultStatus::Success
                } else {
                    BackendResultStatus::Failed
                },
                uploaded_at: Utc::now(),
                size: summary.bytes_uploaded,
                remote_path: prefix.clone(),
                error_message: if failed.is_empty() {
                    None
                } else {
                    Some(failed.join("; "))
                },
            });
        }

        Ok(ArchiveOutcome {
            archive_size: Some(total_bytes),
            archive_hash: None,
            backend_results,
        })
    }

    /// Delete the oldest archives beyond `keep_last` for each backend a
    /// task writes to. Only objects named `<sanitized_task_name>_*` ending
    /// in `.gz` are candidates, ordered by `last_modified` ascending with
    /// ties broken by path ascending; deletion errors are logged but never
    /// change the execution's status.
    async fn apply_retention(&self, task: &Task) {
        if task.archive_options.format != ArchiveFormat::TarGz {
            return;
        }
        if task.retention_policy.keep_last == 0 {
            return;
        }
        let prefix = task.sanitized_name();
        let name_prefix = format!("{prefix}_");

        for backend_id in &task.backend_ids {
            let Ok(backend) = self.config.get_backend(*backend_id).await else {
                continue;
            };
            let Ok(storage) = storage::create_backend(&backend, &self.root) else {
                continue;
            };
            let Ok(mut objects) = storage.list(&prefix, CancellationToken::new()).await else {
                continue;
            };
            objects.retain(|o| {
                let base = o.path.rsplit('/').next().unwrap_or(&o.path);
                base.starts_with(&name_prefix) && base.ends_with(".gz")
            });
            objects.sort_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.path.cmp(&b.path))
            });

            let keep = task.retention_policy.keep_last as usize;
            if objects.len() <= keep {
                continue;
            }
            let to_delete = objects.len() - keep;
            for object in objects.into_iter().take(to_delete) {
                if let Err(e) = storage.delete(&object.path, CancellationToken::new()).await {
                    tracing::warn!(backend = %backend.name, path = %object.path, error = %e, "retention delete failed");
                }
            }
        }
    }
}

fn failed_backend_summary(results: &[BackendResult]) -> String {
    results
        .iter()
        .filter(|r| r.status == BackendResultStatus::Failed)
        .map(|r| format!("{} ({})", r.backend_name, r.error_message.as_deref().unwrap_or("unknown error")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A fresh walk of `source_path` producing the census a dry run reports:
/// file/dir counts, total size, the largest files, and an extension
/// histogram.
fn summarize_source_tree(source_path: &std::path::Path) -> Result<FilesSummary> {
    let mut summary = FilesSummary::default();
    let mut sized: Vec<(String, u64)> = Vec::new();

    for entry in walkdir::WalkDir::new(source_path) {
        let entry = entry.map_err(|e| CoreError::DryRun(e.to_string()))?;
        if entry.file_type().is_dir() {
            if entry.path() != source_path {
                summary.total_dirs += 1;
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| CoreError::DryRun(e.to_string()))?;
        let size = meta.len();
        let relative = entry
            .path()
            .strip_prefix(source_path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        summary.total_files += 1;
        summary.total_size += size;
        sized.push((relative.clone(), size));

        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "<none>".to_string());
        *summary.extension_histogram.entry(ext).or_insert(0) += 1;
    }

    sized.sort_by(|a, b| b.1.cmp(&a.1));
    summary.largest_file = sized.first().cloned();
    summary.top_10_largest = sized.into_iter().take(10).collect();

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::history::HistoryStore;
    use crate::models::{ArchiveOptions, Backend, BackendKind, RetentionPolicy, Schedule, SyncOptions};
    use std::collections::HashMap as StdHashMap;
    use tokio::time::{sleep, Duration};

    async fn new_executor() -> (Executor, Arc<ConfigStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let config = Arc::new(
            ConfigStore::load_or_create_default(&config_path, dir.path(), "temp", "sources")
                .await
                .unwrap(),
        );
        let history = Arc::new(HistoryStore::connect_in_memory().await.unwrap());
        let executor = Executor::new(config.clone(), history, dir.path().to_path_buf()).await;
        (executor, config, dir)
    }

    fn local_backend_config(path: &str) -> StdHashMap<String, serde_json::Value> {
        let mut config = StdHashMap::new();
        config.insert("path".to_string(), serde_json::json!(path));
        config
    }

    async fn add_local_backend(config: &ConfigStore, path: &str) -> Backend {
        let now = Utc::now();
        config
            .add_backend(Backend {
                id: Uuid::nil(),
                name: "local".to_string(),
                kind: BackendKind::Local,
                config: local_backend_config(path),
                enabled: true,
                created_at: now,
                updated_at: now,
                last_test_at: None,
                last_test_status: None,
            })
            .await
            .unwrap()
    }

    async fn add_task(
        config: &ConfigStore,
        name: &str,
        source: &std::path::Path,
        backend_ids: Vec<Uuid>,
        options: ArchiveOptions,
        retention: RetentionPolicy,
    ) -> Task {
        let now = Utc::now();
        config
            .add_task(Task {
                id: Uuid::nil(),
                name: name.to_string(),
                description: String::new(),
                source_path: source.to_string_lossy().to_string(),
                backend_ids,
                schedule: Schedule::Manual,
                archive_options: options,
                retention_policy: retention,
                enabled: true,
                created_at: now,
                updated_at: now,
                last_run: None,
                next_run: None,
            })
            .await
            .unwrap()
    }

    async fn await_terminal(executor: &Executor, task_id: Uuid) -> Execution {
        for _ in 0..200 {
            if !executor.is_running(task_id).await {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        executor.history.get_execution_count(None, None).await.ok();
        let history = executor.history.clone();
        let all = history.list(Some(task_id), None, 1, 0).await.unwrap();
        all.into_iter().next().expect("execution row should exist")
    }

    #[tokio::test]
    async fn archive_happy_path_uploads_and_records_success() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(source.join("sub")).await.unwrap();
        tokio::fs::write(source.join("a.txt"), vec![0u8; 100]).await.unwrap();
        tokio::fs::write(source.join("sub/b.bin"), vec![0u8; 300]).await.unwrap();

        let backend = add_local_backend(&config, "backups").await;
        let task = add_task(
            &config,
            "daily-db",
            &source,
            vec![backend.id],
            ArchiveOptions {
                use_timestamp: true,
                ..ArchiveOptions::default()
            },
            RetentionPolicy::default(),
        )
        .await;

        executor.execute(task.id).await.unwrap();
        let execution = await_terminal(&executor, task.id).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.archive_hash.as_deref().unwrap().starts_with("sha256:"));
        assert_eq!(execution.backend_results.len(), 1);
        assert_eq!(execution.backend_results[0].status, BackendResultStatus::Success);

        let entries: Vec<_> = walkdir::WalkDir::new(dir.path().join("backups"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().to_string_lossy().to_string();
        assert!(name.starts_with("daily-db_"));
        assert!(name.ends_with(".tar.gz"));
    }

    #[tokio::test]
    async fn disabled_task_is_rejected() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(&source).await.unwrap();
        let backend = add_local_backend(&config, "backups").await;
        let mut task = add_task(
            &config,
            "disabled-task",
            &source,
            vec![backend.id],
            ArchiveOptions::default(),
            RetentionPolicy::default(),
        )
        .await;
        task.enabled = false;
        config.update_task(task.clone()).await.unwrap();

        let err = executor.execute(task.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ExecutionError);
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(&source).await.unwrap();
        for i in 0..20 {
            tokio::fs::write(source.join(format!("f{i}.bin")), vec![0u8; 65536]).await.unwrap();
        }
        let backend = add_local_backend(&config, "backups").await;
        let task = add_task(
            &config,
            "busy-task",
            &source,
            vec![backend.id],
            ArchiveOptions::default(),
            RetentionPolicy::default(),
        )
        .await;

        executor.execute(task.id).await.unwrap();
        let err = executor.execute(task.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TaskRunning);
        await_terminal(&executor, task.id).await;
    }

    #[tokio::test]
    async fn partial_backend_failure_still_reports_success_with_detail() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("a.txt"), b"hi").await.unwrap();

        let good = add_local_backend(&config, "good").await;
        // A target path nested under a plain file fails `create_dir_all`,
        // simulating an unreachable backend.
        let bad_target = dir.path().join("not-a-dir");
        tokio::fs::write(&bad_target, b"x").await.unwrap();
        let now = Utc::now();
        let bad = config
            .add_backend(Backend {
                id: Uuid::nil(),
                name: "bad".to_string(),
                kind: BackendKind::Local,
                config: local_backend_config("not-a-dir/nested"),
                enabled: true,
                created_at: now,
                updated_at: now,
                last_test_at: None,
                last_test_status: None,
            })
            .await
            .unwrap();

        let task = add_task(
            &config,
            "mixed",
            &source,
            vec![good.id, bad.id],
            ArchiveOptions::default(),
            RetentionPolicy::default(),
        )
        .await;

        executor.execute(task.id).await.unwrap();
        let execution = await_terminal(&executor, task.id).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("1 of 2 backends failed"));
        assert_eq!(execution.backend_results.len(), 2);
    }

    #[tokio::test]
    async fn sync_mode_reports_only_changed_bytes() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("x"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(source.join("y"), vec![0u8; 20]).await.unwrap();

        let backend = add_local_backend(&config, "backups").await;
        let task = add_task(
            &config,
            "sync-task",
            &source,
            vec![backend.id],
            ArchiveOptions {
                format: ArchiveFormat::Sync,
                sync_options: SyncOptions { delete_remote: true },
                ..ArchiveOptions::default()
            },
            RetentionPolicy::default(),
        )
        .await;

        executor.execute(task.id).await.unwrap();
        let first = await_terminal(&executor, task.id).await;
        assert_eq!(first.status, ExecutionStatus::Success);
        assert_eq!(first.archive_size, Some(30));

        // Second run against an unchanged tree uploads nothing new.
        executor.execute(task.id).await.unwrap();
        let second = await_terminal(&executor, task.id).await;
        assert_eq!(second.archive_size, Some(0));
    }

    #[tokio::test]
    async fn retention_trims_to_keep_last_matching_files_only() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("a.txt"), b"hi").await.unwrap();

        let backend = add_local_backend(&config, "backups").await;
        let backups_dir = dir.path().join("backups").join("taskx");
        tokio::fs::create_dir_all(&backups_dir).await.unwrap();
        for day in 1..=6 {
            let name = format!("taskx_202501{day:02}_000000.tar.gz");
            tokio::fs::write(backups_dir.join(&name), b"old").await.unwrap();
        }
        // Also seed a file that must never be touched by retention.
        tokio::fs::write(backups_dir.join("README.txt"), b"keep me").await.unwrap();

        let task = add_task(
            &config,
            "taskx",
            &source,
            vec![backend.id],
            ArchiveOptions::default(),
            RetentionPolicy { keep_last: 3 },
        )
        .await;

        executor.execute(task.id).await.unwrap();
        await_terminal(&executor, task.id).await;

        let remaining: Vec<_> = walkdir::WalkDir::new(&backups_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();

        assert!(remaining.contains(&"README.txt".to_string()));
        let gz_count = remaining.iter().filter(|n| n.ends_with(".gz")).count();
        // 6 preloaded + 1 freshly created, trimmed to keep_last = 3.
        assert_eq!(gz_count, 3);
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled_status() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(&source).await.unwrap();
        for i in 0..200 {
            tokio::fs::write(source.join(format!("f{i}.bin")), vec![0u8; 65536]).await.unwrap();
        }
        let backend = add_local_backend(&config, "backups").await;
        let task = add_task(
            &config,
            "cancel-me",
            &source,
            vec![backend.id],
            ArchiveOptions::default(),
            RetentionPolicy::default(),
        )
        .await;

        let execution = executor.execute(task.id).await.unwrap();
        executor.cancel(execution.id).await;
        let terminal = await_terminal(&executor, task.id).await;

        assert_eq!(terminal.status, ExecutionStatus::Cancelled);
        // The in-memory running map must always be cleared on exit.
        assert!(!executor.is_running(task.id).await);
    }

    #[tokio::test]
    async fn dry_run_reports_file_census_and_backend_plan() {
        let (executor, config, dir) = new_executor().await;
        let source = dir.path().join("src");
        tokio::fs::create_dir_all(source.join("sub")).await.unwrap();
        tokio::fs::write(source.join("a.txt"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(source.join("sub/b.txt"), vec![0u8; 40]).await.unwrap();

        let backend = add_local_backend(&config, "backups").await;
        tokio::fs::create_dir_all(dir.path().join("backups")).await.unwrap();
        let task = add_task(
            &config,
            "census",
            &source,
            vec![backend.id],
            ArchiveOptions::default(),
            RetentionPolicy::default(),
        )
        .await;

        let report = executor.execute_dry_run(task.id).await.unwrap();
        assert_eq!(report.files_summary.total_files, 2);
        assert_eq!(report.files_summary.total_size, 50);
        assert_eq!(report.files_summary.total_dirs, 1);
        assert_eq!(
            report.files_summary.largest_file,
            Some(("sub/b.txt".to_string(), 40))
        );
        assert_eq!(report.per_backend.len(), 1);
        assert!(report.per_backend[0].test_passed);
        assert_eq!(report.per_backend[0].uploads.len(), 1);
        assert!(report.estimated_archive_size.unwrap() < 50);
    }
}
