//! Google Cloud Storage backend.
//!
//! Grounded on the teacher's `storage::gcs::GcsBackend`: credential-shape
//! matching against the backend config, and `time`→`chrono` conversion for
//! object timestamps returned by the SDK.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{ProgressCallback, RemoteObject, Result, StorageBackend, StorageUsage, UploadedObject};
use crate::error::StorageError;
use crate::models::{Backend, BackendKind};

pub struct GcsBackend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl GcsBackend {
    pub fn from_config(backend: &Backend) -> Result<Self> {
        let bucket = super::required_config(backend, "bucket")?;
        let credentials_json = super::required_config(backend, "credentials_json")?;

        let credentials: google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile =
            serde_json::from_str(&credentials_json)
                .map_err(|e| StorageError::AuthenticationFailed(e.to_string()))?;

        // The client is built lazily in `initialize`, since SDK config
        // construction is itself async and this constructor is not.
        let client_config = futures::executor::block_on(
            ClientConfig::default().with_credentials(credentials),
        )
        .map_err(|e| StorageError::AuthenticationFailed(e.to_string()))?;

        Ok(Self {
            client: Client::new(client_config),
            bucket,
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
impl StorageBackend for GcsBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        self.client
            .list_objects(&ListObjectsRequest {
                bucket: self.bucket.clone(),
                max_results: Some(1),
                ..Default::default()
            })
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

        let upload = self.client.upload_object(
            &UploadObjectRequest {
                bucket: self.bucket.clone(),
                ..Default::default()
            },
            bytes,
            &UploadType::Simple(Media::new(key.clone())),
        );

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
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let full_prefix = self.key_for(prefix);
        let response = self
            .client
            .list_objects(&ListObjectsRequest {
                bucket: self.bucket.clone(),
                prefix: Some(full_prefix),
                ..Default::default()
            })
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?;

        let mut out = Vec::new();
        for object in response.items.unwrap_or_default() {
            let path = self
                .prefix
                .as_deref()
                .and_then(|p| object.name.strip_prefix(&format!("{p}/")))
                .unwrap_or(&object.name)
                .to_string();
            let last_modified: DateTime<Utc> = object
                .updated
                .map(|t| t.into())
                .unwrap_or_else(Utc::now);
            out.push(RemoteObject {
                path,
                size: object.size as u64,
                last_modified,
            });
        }
        Ok(out)
    }

    async fn delete(&self, remote_path: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: self.key_for(remote_path),
                ..Default::default()
            })
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;
        Ok(())
    }

    async fn get_usage(&self, cancel: CancellationToken) -> Result<StorageUsage> {
        let objects = self.list("", cancel).await?;
        Ok(StorageUsage {
            used_bytes: Some(objects.iter().map(|o| o.size).sum()),
            object_count: Some(objects.len() as u64),
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Gcs
    }
}
