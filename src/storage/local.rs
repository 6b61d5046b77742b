//! Local filesystem backend: a plain directory tree as a backup target.
//!
//! Not present in the teacher (which only speaks to cloud object stores),
//! but follows its per-backend module shape; the chunked copy-with-progress
//! loop is the same pattern the archive builder uses for hashing-while-
//! streaming.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{ProgressCallback, RemoteObject, Result, StorageBackend, StorageUsage, UploadedObject};
use crate::error::StorageError;
use crate::models::{Backend, BackendKind};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn from_config(backend: &Backend, resolve_root: &Path) -> Result<Self> {
        let path = super::required_config(backend, "path")?;
        let candidate = Path::new(&path);
        let root = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            resolve_root.join(candidate)
        };
        Ok(Self { root })
    }

    fn full_path(&self, remote_path: &str) -> PathBuf {
        self.root.join(remote_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        if !meta.is_dir() {
            return Err(StorageError::ConnectionFailed(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadedObject> {
        let dest = self.full_path(remote_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let total = fs::metadata(local_path).await?.len();
        let mut src = fs::File::open(local_path).await?;
        let mut dst = fs::File::create(&dest).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                let _ = fs::remove_file(&dest).await;
                return Err(StorageError::Cancelled);
            }
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).await?;
            transferred += n as u64;
            if let Some(cb) = &progress {
                cb(transferred, total);
            }
        }
        dst.flush().await?;

        Ok(UploadedObject {
            remote_path: remote_path.to_string(),
            size: transferred,
        })
    }

    async fn list(&self, prefix: &str, cancel: CancellationToken) -> Result<Vec<RemoteObject>> {
        let search_root = self.full_path(prefix);
        if !search_root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&search_root).into_iter().filter_map(|e| e.ok()) {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| StorageError::ListFailed(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let last_modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(RemoteObject {
                path: relative,
                size: meta.len(),
                last_modified,
            });
        }
        Ok(out)
    }

    async fn delete(&self, remote_path: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let path = self.full_path(remote_path);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(e.to_string())),
        }
    }

    async fn get_usage(&self, cancel: CancellationToken) -> Result<StorageUsage> {
        let objects = self.list("", cancel).await?;
        let used_bytes = objects.iter().map(|o| o.size).sum();
        Ok(StorageUsage {
            used_bytes: Some(used_bytes),
            object_count: Some(objects.len() as u64),
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendKind;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn mk_backend(path: &str) -> Backend {
        let now = Utc::now();
        let mut config = HashMap::new();
        config.insert("path".to_string(), serde_json::json!(path));
        Backend {
            id: Uuid::new_v4(),
            name: "local".to_string(),
            kind: BackendKind::Local,
            config,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_test_at: None,
            last_test_status: None,
        }
    }

    #[tokio::test]
    async fn upload_then_list_then_delete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src_file = src_dir.path().join("a.tar.gz");
        fs::write(&src_file, b"hello world").await.unwrap();

        let backend = LocalBackend::from_config(&mk_backend("dest"), dir.path()).unwrap();
        backend.initialize().await.unwrap();
        backend.test_connection().await.unwrap();

        let uploaded = backend
            .upload(&src_file, "task/a.tar.gz", CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(uploaded.size, 11);

        let listed = backend.list("task", CancellationToken::new()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "task/a.tar.gz");

        backend.delete("task/a.tar.gz", CancellationToken::new()).await.unwrap();
        assert!(backend.list("task", CancellationToken::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_upload_cleans_up_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src_file = src_dir.path().join("big.bin");
        fs::write(&src_file, vec![0u8; CHUNK_SIZE * 4]).await.unwrap();

        let backend = LocalBackend::from_config(&mk_backend("dest"), dir.path()).unwrap();
        backend.initialize().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = backend
            .upload(&src_file, "big.bin", token, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert!(!dir.path().join("big.bin").exists());
    }
}
