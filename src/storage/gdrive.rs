//! Google Drive backend, uploading into a single shared folder.
//!
//! Enrichment beyond the teacher's cloud-object-store trio; grounded on
//! `google-drive3`'s hub pattern (a `DriveHub` built over a `hyper` client
//! and an OAuth2 service-account authenticator), the idiomatic way to talk
//! to Drive from async Rust.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_drive3::api::File as DriveFile;
use google_drive3::hyper::client::HttpConnector;
use google_drive3::hyper_rustls::HttpsConnector;
use google_drive3::oauth2::{self, ServiceAccountAuthenticator};
use google_drive3::DriveHub;
use std::io::Cursor;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{ProgressCallback, RemoteObject, Result, StorageBackend, StorageUsage, UploadedObject};
use crate::error::StorageError;
use crate::models::{Backend, BackendKind};

type Hub = DriveHub<HttpsConnector<HttpConnector>>;

pub struct GdriveBackend {
    hub: Hub,
    folder_id: String,
}

impl GdriveBackend {
    pub fn from_config(backend: &Backend) -> Result<Self> {
        let service_account_json = super::required_config(backend, "service_account_json")?;
        let folder_id = super::required_config(backend, "folder_id")?;

        let key = oauth2::parse_service_account_key(service_account_json)
            .map_err(|e| StorageError::AuthenticationFailed(e.to_string()))?;

        let hub = futures::executor::block_on(async {
            let auth = ServiceAccountAuthenticator::builder(key)
                .build()
                .await
                .map_err(|e| StorageError::AuthenticationFailed(e.to_string()))?;
            let client = google_drive3::hyper::Client::builder().build(
                google_drive3::hyper_rustls::HttpsConnectorBuilder::new()
                    .with_native_roots()
                    .https_only()
                    .enable_http1()
                    .enable_http2()
                    .build(),
            );
            Ok::<_, StorageError>(DriveHub::new(client, auth))
        })?;

        Ok(Self { hub, folder_id })
    }

    fn named(&self, remote_path: &str) -> String {
        remote_path.replace('/', "__")
    }

    /// The Drive file id for `remote_path` in this backend's folder, if a
    /// file with that name already exists there. Used so `upload` becomes
    /// an update rather than always creating a new file.
    async fn find_file_id(&self, remote_path: &str) -> Result<Option<String>> {
        let query = format!(
            "'{}' in parents and name = '{}' and trashed = false",
            self.folder_id,
            self.named(remote_path)
        );
        let (_, file_list) = self
            .hub
            .files()
            .list()
            .q(&query)
            .doit()
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?;
        Ok(file_list.files.unwrap_or_default().into_iter().find_map(|f| f.id))
    }
}

#[async_trait]
impl StorageBackend for GdriveBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        self.hub
            .files()
            .get(&self.folder_id)
            .doit()
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
        let existing_id = self.find_file_id(remote_path).await?;

        let upload = if let Some(file_id) = existing_id {
            self.hub
                .files()
                .update(DriveFile::default(), &file_id)
                .upload(Cursor::new(bytes), "application/gzip".parse().unwrap())
        } else {
            let metadata = DriveFile {
                name: Some(self.named(remote_path)),
                parents: Some(vec![self.folder_id.clone()]),
                ..Default::default()
            };
            self.hub
                .files()
                .create(metadata)
                .upload(Cursor::new(bytes), "application/gzip".parse().unwrap())
        };

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
        let query = format!("'{}' in parents and trashed = false", self.folder_id);
        let (_, file_list) = self
            .hub
            .files()
            .list()
            .q(&query)
            .param("fields", "files(name,size,modifiedTime)")
            .doit()
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?;

        let mut out = Vec::new();
        for file in file_list.files.unwrap_or_default() {
            let Some(name) = file.name else { continue };
            let path = name.replace("__", "/");
            if !path.starts_with(prefix) {
                continue;
            }
            let last_modified: DateTime<Utc> = file
                .modified_time
                .map(|t| t.into())
                .unwrap_or_else(Utc::now);
            out.push(RemoteObject {
                path,
                size: file.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                last_modified,
            });
        }
        Ok(out)
    }

    async fn delete(&self, remote_path: &str, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let query = format!(
            "'{}' in parents and name = '{}' and trashed = false",
            self.folder_id,
            self.named(remote_path)
        );
        let (_, file_list) = self
            .hub
            .files()
            .list()
            .q(&query)
            .doit()
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;

        for file in file_list.files.unwrap_or_default() {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if let Some(id) = file.id {
                self.hub
                    .files()
                    .delete(&id)
                    .doit()
                    .await
                    .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;
            }
        }
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
        BackendKind::Gdrive
    }
}
