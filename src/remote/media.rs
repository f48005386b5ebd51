//! Attachment upload over multipart HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::info;

use crate::auth::AuthContext;
use crate::config::RemoteConfig;
use crate::entity::Attachment;
use crate::error::SyncError;
use crate::mutation::PendingAttachment;
use crate::remote::http::{build_client, parse_base, status_error, transport_error};
use crate::remote::MediaUploader;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Uploads to `POST {base_url}/api/media`.
pub struct HttpMediaUploader {
    client: Client,
    endpoint: Url,
    auth: Arc<dyn AuthContext>,
}

impl HttpMediaUploader {
    pub fn new(config: &RemoteConfig, auth: Arc<dyn AuthContext>) -> Result<Self, SyncError> {
        let base = parse_base(config)?;
        let endpoint = base.join("api/media").map_err(|e| SyncError::RemoteRejected {
            status: 0,
            message: e.to_string(),
        })?;
        Ok(Self {
            client: build_client(config)?,
            endpoint,
            auth,
        })
    }
}

#[async_trait]
impl MediaUploader for HttpMediaUploader {
    async fn upload(&self, attachment: &PendingAttachment) -> Result<Attachment, SyncError> {
        let bytes = tokio::fs::read(&attachment.path)
            .await
            .map_err(|e| SyncError::Storage(format!("{}: {e}", attachment.path.display())))?;
        let size = bytes.len();
        let file_name = attachment
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(attachment.kind.mime())
            .map_err(transport_error)?;
        let form = Form::new().part("file", part);

        let mut req = self.client.post(self.endpoint.clone()).multipart(form);
        if let Some(token) = self.auth.current().token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(status_error(resp, None).await);
        }

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(transport_error)?;
        let parsed: UploadResponse =
            serde_json::from_slice(&body).map_err(|e| SyncError::RemoteRejected {
                status,
                message: format!("failed to parse upload response: {e}"),
            })?;

        info!(url = %parsed.url, size, kind = ?attachment.kind, "Uploaded attachment");
        Ok(Attachment {
            url: parsed.url,
            kind: attachment.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedAuth;
    use crate::entity::AttachmentType;

    #[tokio::test]
    async fn test_missing_file_is_storage_error() {
        let uploader =
            HttpMediaUploader::new(&RemoteConfig::default(), Arc::new(SharedAuth::anonymous()))
                .unwrap();
        let err = uploader
            .upload(&PendingAttachment {
                path: "/nonexistent/photo.jpg".into(),
                kind: AttachmentType::Image,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
