//! Azure Blob Storage backend.
//!
//! Grounded on the teacher's `storage::azure::AzureBackend`: a
//! `StorageCredentials::access_key` client built from account name/key, one
//! container per backend.

use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{ProgressCallback, RemoteObject, Result, StorageBackend, StorageUsage, UploadedObject};
use crate::error::StorageError;
use crate::models::{Backend, BackendKind};

pub struct AzureBackend {
    container_client: ContainerClient,
    prefix: Option<String>,
}

impl AzureBackend {
    pub fn from_config(backend: &Backend) -> Result<Self> {
        let account = super::required_config(backend, "account")?;
        let access_key = super::required_config(backend, "access_key")?;
        let container = super::required_config(backend, "container")?;

        let credentials = StorageCredentials::access_key(account.clone(), access_key);
        let service_client = BlobServiceClient::new(account, credentials);
        let container_client = service_client.container_client(container);

        Ok(Self {
            container_client,
            prefix: backend.prefix().map(str::to_string),
        })
    }

    fn key_for(&self, remote_path: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{remote_path}"),
            None => remote_path.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for AzureBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        self.container_client
            .get_properties()
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadedObject> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let bytes = tokio::fs::read(local_path).await?;
        let total = bytes.len() as u64;
        let key = self.key_for(remote_path);
        let blob_client = self.container_client.blob_client(key);

        let upload = blob_client.put_block_blob(bytes).into_future();

        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            result = upload => {
                result.map_err(|e| StorageError::UploadFailed(e.to_string()))?;
                if let Some(cb) = &progress {
                    cb(total, total);
                }
                Ok(UploadedObject { remote_path: remote_path.to_string(), size: total })
            }
        }
    }

    async fn list(&self, prefix: &str, cancel: CancellationToken) -> Result<Vec<RemoteObject>> {
        let full_prefix = self.key_for(prefix);
        let mut stream = self
            .container_client
            .list_blobs()
            .prefix(full_prefix)
            .into_stream();

        let mut out = Vec::new();
        while let Some(page) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let page = page.map_err(|e| StorageError::ListFailed(e.to_string()))?;
            for blob in page.blobs.blobs() {
                let path = self
                    .prefix
                    .as_deref()
                    .and_then(|p| blob.name.strip_prefix(&format!("{p}/")))
                    .unwrap_or(&blob.name)
                    .to_string();
                let last_modified: DateTime<Utc> = blob.properties.last_modified.into();
                out.push(RemoteObject {
                    path,
                    size: blob.properties.content_length,
                    last_modified,
                });
            }
        }
        Ok(out)
    }

    async fn delete(&self, remote_path: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let blob_client = self.container_client.blob_client(self.key_for(remote_path));
        blob_client
            .delete()
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }
}
