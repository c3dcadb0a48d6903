//! Object storage over plain HTTP.
//!
//! `PUT {base_url}/object/{bucket}/{key}` with a bearer token; the server
//! answers with a JSON descriptor carrying the public URL.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::ObjectStorage;
use crate::error::BackendError;

#[derive(Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

pub struct HttpObjectStorage {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpObjectStorage {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: Client::new(),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, bucket, key)
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let response = self
            .client
            .put(self.object_url(bucket, key))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                BackendError::Network(format!("{} - {}", status, body))
            } else {
                BackendError::Rejected(format!("{} - {}", status, body))
            });
        }

        // Some servers answer with an empty body; the public URL is derivable
        let descriptor: UploadResponse = response.json().await.unwrap_or(UploadResponse { url: None });
        Ok(descriptor.url.unwrap_or_else(|| self.public_url(bucket, key)))
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/object/public/{}/{}", self.base_url, bucket, key)
    }
}
