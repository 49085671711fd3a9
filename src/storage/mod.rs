//! Publishing artifacts to object storage behind a public shared link.
//!
//! Upload always overwrites. Link creation is idempotent from the caller's point of
//! view: when the store reports that a link already exists for the path, the existing
//! link is looked up and returned instead of failing.

pub mod dropbox;
pub mod key;
pub mod memory;

use crate::error::{PublishError, StorageError, StorageErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use key::{KeyStrategy, StorageKey};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `path`, replacing whatever is there.
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), StorageError>;

    /// Create a public link for `path`. Fails with `LinkAlreadyExists` if one exists.
    async fn create_link(&self, path: &str) -> Result<String, StorageError>;

    /// Resolve link metadata by url, returning the canonical link url.
    async fn link_metadata(&self, url: &str) -> Result<String, StorageError>;

    /// Links that point directly at `path`.
    async fn list_links(&self, path: &str) -> Result<Vec<String>, StorageError>;
}

/// How to find the existing link after a creation conflict, when the conflict
/// itself did not carry the link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkLookup {
    /// List links scoped to the path and take the first.
    #[default]
    List,
    /// Metadata lookup keyed on `<base><path>`.
    Metadata { base_url: String },
}

impl FromStr for LinkLookup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(LinkLookup::List),
            other => match other.strip_prefix("metadata:") {
                Some(base) if !base.is_empty() => Ok(LinkLookup::Metadata {
                    base_url: base.trim_end_matches('/').to_string(),
                }),
                _ => Err(format!(
                    "unknown link lookup {other}, expected `list` or `metadata:<base url>`"
                )),
            },
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    lookup: LinkLookup,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, lookup: LinkLookup) -> Self {
        Self { store, lookup }
    }

    pub async fn publish(&self, bytes: Bytes, key: &StorageKey) -> Result<String, PublishError> {
        let path = key.path();

        self.store
            .upload(&path, bytes)
            .await
            .map_err(|source| PublishError::Upload {
                key: key.to_string(),
                source,
            })?;
        debug!(path = %path, "Uploaded artifact");

        match self.store.create_link(&path).await {
            Ok(url) => {
                info!(path = %path, url = %url, "Created shared link");
                Ok(url)
            }
            Err(err) if err.is_link_conflict() => {
                info!(path = %path, "Shared link already exists, retrieving it");
                self.resolve_existing(key, &path, err.existing_url).await
            }
            Err(source) => Err(PublishError::LinkCreate {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn resolve_existing(
        &self,
        key: &StorageKey,
        path: &str,
        from_conflict: Option<String>,
    ) -> Result<String, PublishError> {
        if let Some(url) = from_conflict {
            return Ok(url);
        }

        let lookup_err = |reason: String| PublishError::LinkLookup {
            key: key.to_string(),
            reason,
        };

        match &self.lookup {
            LinkLookup::List => {
                let links = self
                    .store
                    .list_links(path)
                    .await
                    .map_err(|e| lookup_err(e.to_string()))?;
                links
                    .into_iter()
                    .next()
                    .ok_or_else(|| lookup_err("no shared links found".into()))
            }
            LinkLookup::Metadata { base_url } => {
                let canonical = format!("{base_url}{path}");
                self.store
                    .link_metadata(&canonical)
                    .await
                    .map_err(|e| match e.kind {
                        StorageErrorKind::NotFound => {
                            warn!(url = %canonical, "No link metadata for canonical url");
                            lookup_err(format!("no link metadata for {canonical}"))
                        }
                        _ => lookup_err(e.to_string()),
                    })
            }
        }
    }
}
