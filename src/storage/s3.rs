//! S3 and S3-compatible (MinIO, etc.) backend.
//!
//! Grounded directly on the teacher's `storage::s3::S3Backend`: a static
//! client built once from region/endpoint/credentials config, a
//! `map_s3_error` translation helper, and paginated listing.

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{ProgressCallback, RemoteObject, Result, StorageBackend, StorageUsage, UploadedObject};
use crate::error::StorageError;
use crate::models::{Backend, BackendKind};

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    storage_class: Option<StorageClass>,
}

impl S3Backend {
    pub fn from_config(backend: &Backend) -> Result<Self> {
        let bucket = super::required_config(backend, "bucket")?;
        let region = backend
            .config_str("region")
            .unwrap_or("us-east-1")
            .to_string();
        let access_key_id = super::required_config(backend, "access_key_id")?;
        let secret_access_key = super::required_config(backend, "secret_access_key")?;
        let endpoint = backend.config_str("endpoint").map(str::to_string);
        let path_style = backend
            .config
            .get("path_style")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "taskvault-static",
        );

        let mut config_builder = aws_sdk_s3::Config::builder()
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(path_style);
        if let Some(endpoint) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(config_builder.build());

        let storage_class = match backend.config_str("storage_class") {
            None => None,
            Some(raw) => {
                let class = StorageClass::from(raw);
                if matches!(class, StorageClass::Unknown(_)) {
                    return Err(StorageError::Validation(format!(
                        "unknown S3 storage class `{raw}`"
                    )));
                }
                Some(class)
            }
        };

        Ok(Self {
            client,
            bucket,
            prefix: backend.prefix().map(str::to_string),
            storage_class,
        })
    }

    fn key_for(&self, remote_path: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{remote_path}"),
            None => remote_path.to_string(),
        }
    }
}

fn map_s3_error<E: std::fmt::Display>(context: &str, err: E) -> StorageError {
    StorageError::UploadFailed(format!("{context}: {err}"))
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
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
        let total = tokio::fs::metadata(local_path).await?.len();
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| map_s3_error("reading local file", e))?;
        let key = self.key_for(remote_path);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body);
        if let Some(class) = self.storage_class.clone() {
            request = request.storage_class(class);
        }
        let upload = request.send();

        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            result = upload => {
                result.map_err(|e| map_s3_error("put_object", e))?;
                if let Some(cb) = &progress {
                    cb(total, total);
                }
                Ok(UploadedObject { remote_path: remote_path.to_string(), size: total })
            }
        }
    }

    async fn list(&self, prefix: &str, cancel: CancellationToken) -> Result<Vec<RemoteObject>> {
        let full_prefix = self.key_for(prefix);
        let mut out = Vec::new();
        let mut continuation_token = None;

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StorageError::ListFailed(e.to_string()))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let path = self
                    .prefix
                    .as_deref()
                    .and_then(|p| key.strip_prefix(&format!("{p}/")))
                    .unwrap_or(key)
                    .to_string();
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(Utc::now);
                out.push(RemoteObject {
                    path,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                });
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(out)
    }

    async fn delete(&self, remote_path: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key_for(remote_path))
            .send()
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }
}
