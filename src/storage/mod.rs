//! The storage backend contract and the factory that builds concrete
//! implementations from a [`Backend`] configuration record.
//!
//! Narrower than the teacher's `StorageBackend` (no multipart/presign/copy
//! surface — this system only ever uploads whole objects and lists/deletes
//! them), but carries the teacher's `async_trait` shape and its
//! cancellation-aware style borrowed from the `RemoteStorage` trait pattern
//! seen elsewhere in the retrieval pack.

pub mod azure;
pub mod b2;
pub mod gcs;
pub mod gdrive;
pub mod local;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::models::{Backend, BackendKind};

type Result<T> = std::result::Result<T, StorageError>;

/// Invoked with `(bytes_transferred, total_bytes)` as an upload progresses.
/// `total_bytes` is `0` when unknown ahead of time.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// One object as returned from a backend listing.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// The result of a single successful upload.
#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub remote_path: String,
    pub size: u64,
}

/// Best-effort capacity report; fields are `None` where a backend has no
/// cheap way to answer (e.g. S3 has no native "bytes used" query).
#[derive(Debug, Clone, Default)]
pub struct StorageUsage {
    pub used_bytes: Option<u64>,
    pub object_count: Option<u64>,
}

/// A destination a task can archive or sync to.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// One-time setup: validate configuration shape, create local
    /// directories, or otherwise prepare for use. Called once after
    /// construction, before any other method.
    async fn initialize(&self) -> Result<()>;

    /// Verify connectivity and credentials without mutating anything.
    async fn test_connection(&self) -> Result<()>;

    /// Upload the file at `local_path` to `remote_path`, reporting progress
    /// through `progress` and honoring `cancel`.
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadedObject>;

    /// List every object whose path starts with `prefix`.
    async fn list(&self, prefix: &str, cancel: CancellationToken) -> Result<Vec<RemoteObject>>;

    async fn delete(&self, remote_path: &str, cancel: CancellationToken) -> Result<()>;

    /// Best-effort capacity report; backends that cannot answer cheaply
    /// return the zero-value [`StorageUsage`].
    async fn get_usage(&self, cancel: CancellationToken) -> Result<StorageUsage> {
        let _ = cancel;
        Ok(StorageUsage::default())
    }

    /// Release any held resources (connection pools, file handles). Most
    /// backends have nothing to do here.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> BackendKind;
}

/// Construct the concrete [`StorageBackend`] for `backend`, resolving any
/// local filesystem paths in its configuration against `root`.
pub fn create_backend(backend: &Backend, root: &Path) -> Result<Box<dyn StorageBackend>> {
    match backend.kind {
        BackendKind::Local => Ok(Box::new(local::LocalBackend::from_config(backend, root)?)),
        BackendKind::S3 => Ok(Box::new(s3::S3Backend::from_config(backend)?)),
        BackendKind::Gcs => Ok(Box::new(gcs::GcsBackend::from_config(backend)?)),
        BackendKind::Azure => Ok(Box::new(azure::AzureBackend::from_config(backend)?)),
        BackendKind::B2 => Ok(Box::new(b2::B2Backend::from_config(backend)?)),
        BackendKind::Gdrive => Ok(Box::new(gdrive::GdriveBackend::from_config(backend)?)),
    }
}

/// Read a required string field out of a backend's config map.
pub(crate) fn required_config(backend: &Backend, key: &str) -> Result<String> {
    backend
        .config_str(key)
        .map(str::to_string)
        .ok_or_else(|| StorageError::Validation(format!("missing required config key `{key}`")))
}
