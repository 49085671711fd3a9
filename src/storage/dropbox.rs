//! Dropbox HTTP API v2 client for uploads and shared links.

use super::ObjectStore;
use crate::error::{StorageError, StorageErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

#[derive(Clone, Debug)]
pub struct DropboxConfig {
    pub access_token: String,
    pub api_url: String,
    pub content_url: String,
    pub timeout: Duration,
}

impl DropboxConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_url: DEFAULT_API_URL.to_string(),
            content_url: DEFAULT_CONTENT_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct DropboxStore {
    http_client: Client,
    config: DropboxConfig,
}

#[derive(Debug, Deserialize)]
struct LinkMetadata {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ListLinksResult {
    links: Vec<LinkMetadata>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_summary: String,
    #[serde(default)]
    error: Value,
}

impl DropboxStore {
    pub fn new(config: DropboxConfig) -> Result<Self, StorageError> {
        let http_client = Client::builder().timeout(config.timeout).build()?;

        info!(api_url = %config.api_url, "Dropbox client initialized");
        Ok(Self {
            http_client,
            config,
        })
    }

    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T, StorageError> {
        let url = format!("{}/2/{endpoint}", self.config.api_url);
        let resp = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }
}

/// Map a non-success response onto a storage error kind.
async fn check_status(resp: Response) -> Result<Response, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(StorageError::new(StorageErrorKind::Unauthorized, text))
        }
        StatusCode::CONFLICT => Err(classify_conflict(&text)),
        _ => Err(StorageError::new(
            StorageErrorKind::Api,
            format!("{status}: {text}"),
        )),
    }
}

fn classify_conflict(body: &str) -> StorageError {
    let Ok(api_error) = serde_json::from_str::<ApiError>(body) else {
        return StorageError::new(StorageErrorKind::Api, body);
    };

    let summary = api_error.error_summary.as_str();
    if summary.starts_with("shared_link_already_exists") {
        let existing = api_error
            .error
            .pointer("/shared_link_already_exists/metadata/url")
            .and_then(Value::as_str)
            .map(str::to_owned);
        StorageError::link_exists(existing)
    } else if summary.contains("not_found") {
        StorageError::new(StorageErrorKind::NotFound, summary)
    } else {
        StorageError::new(StorageErrorKind::Api, summary)
    }
}

#[async_trait]
impl ObjectStore for DropboxStore {
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let url = format!("{}/2/files/upload", self.config.content_url);
        let arg = json!({ "path": path, "mode": "overwrite", "mute": true });
        let size = bytes.len();

        let resp = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        check_status(resp).await?;

        debug!(path, size, "Dropbox upload complete");
        Ok(())
    }

    async fn create_link(&self, path: &str) -> Result<String, StorageError> {
        let link: LinkMetadata = self
            .rpc("sharing/create_shared_link_with_settings", json!({ "path": path }))
            .await?;
        Ok(link.url)
    }

    async fn link_metadata(&self, url: &str) -> Result<String, StorageError> {
        let link: LinkMetadata = self
            .rpc("sharing/get_shared_link_metadata", json!({ "url": url }))
            .await?;
        Ok(link.url)
    }

    async fn list_links(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let result: ListLinksResult = self
            .rpc(
                "sharing/list_shared_links",
                json!({ "path": path, "direct_only": true }),
            )
            .await?;
        Ok(result.links.into_iter().map(|l| l.url).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> DropboxStore {
        DropboxStore::new(DropboxConfig {
            access_token: "token".into(),
            api_url: server.uri(),
            content_url: server.uri(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upload_sends_overwrite_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/upload"))
            .and(header("authorization", "Bearer token"))
            .and(header_exists("dropbox-api-arg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "a.jpg" })))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .upload("/a.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let arg = requests[0].headers.get("dropbox-api-arg").unwrap();
        let arg: Value = serde_json::from_slice(arg.as_bytes()).unwrap();
        assert_eq!(arg, json!({ "path": "/a.jpg", "mode": "overwrite", "mute": true }));
        assert_eq!(requests[0].body, b"jpeg".to_vec());
    }

    #[tokio::test]
    async fn create_link_returns_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/sharing/create_shared_link_with_settings"))
            .and(body_json(json!({ "path": "/a.jpg" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                ".tag": "file",
                "url": "https://www.dropbox.com/s/abc/a.jpg?dl=0",
                "name": "a.jpg"
            })))
            .mount(&server)
            .await;

        let url = store(&server).create_link("/a.jpg").await.unwrap();
        assert_eq!(url, "https://www.dropbox.com/s/abc/a.jpg?dl=0");
    }

    #[tokio::test]
    async fn existing_link_is_tagged_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/sharing/create_shared_link_with_settings"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error_summary": "shared_link_already_exists/metadata/..",
                "error": {
                    ".tag": "shared_link_already_exists",
                    "shared_link_already_exists": {
                        ".tag": "metadata",
                        "metadata": {
                            ".tag": "file",
                            "url": "https://www.dropbox.com/s/abc/a.jpg?dl=0"
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let err = store(&server).create_link("/a.jpg").await.unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::LinkAlreadyExists);
        assert_eq!(
            err.existing_url.as_deref(),
            Some("https://www.dropbox.com/s/abc/a.jpg?dl=0")
        );
    }

    #[tokio::test]
    async fn classifies_other_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/sharing/get_shared_link_metadata"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error_summary": "shared_link_not_found/..",
                "error": { ".tag": "shared_link_not_found" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/upload"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_access_token"))
            .mount(&server)
            .await;

        let store = store(&server);
        let err = store.link_metadata("https://www.dropbox.com/a.jpg").await.unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::NotFound);

        let err = store
            .upload("/a.jpg", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn lists_direct_links() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/sharing/list_shared_links"))
            .and(body_json(json!({ "path": "/a.jpg", "direct_only": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "links": [
                    { ".tag": "file", "url": "https://www.dropbox.com/s/abc/a.jpg?dl=0" }
                ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let links = store(&server).list_links("/a.jpg").await.unwrap();
        assert_eq!(links, vec!["https://www.dropbox.com/s/abc/a.jpg?dl=0".to_string()]);
    }
}
