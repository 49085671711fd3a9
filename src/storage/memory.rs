//! In-process object store, used by tests and local dry runs.

use super::ObjectStore;
use crate::error::{StorageError, StorageErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const LINK_BASE: &str = "https://share.local";

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
    links: Mutex<HashMap<String, String>>,
    bare_conflicts: bool,
    links_hidden: AtomicBool,
    uploads_fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report link conflicts without the existing link attached.
    pub fn with_bare_conflicts(mut self) -> Self {
        self.bare_conflicts = true;
        self
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.uploads_fail.store(fail, Ordering::SeqCst);
    }

    /// Make `list_links` return nothing from now on.
    pub fn hide_links(&self) {
        self.links_hidden.store(true, Ordering::SeqCst);
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        if self.uploads_fail.load(Ordering::SeqCst) {
            return Err(StorageError::new(
                StorageErrorKind::Transport,
                "upload rejected",
            ));
        }
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn create_link(&self, path: &str) -> Result<String, StorageError> {
        if !self.objects.lock().unwrap().contains_key(path) {
            return Err(StorageError::new(StorageErrorKind::NotFound, path));
        }

        let mut links = self.links.lock().unwrap();
        if let Some(existing) = links.get(path) {
            let attached = (!self.bare_conflicts).then(|| existing.clone());
            return Err(StorageError::link_exists(attached));
        }
        let url = format!("{LINK_BASE}{path}");
        links.insert(path.to_string(), url.clone());
        Ok(url)
    }

    async fn link_metadata(&self, url: &str) -> Result<String, StorageError> {
        self.links
            .lock()
            .unwrap()
            .values()
            .find(|link| link.as_str() == url)
            .cloned()
            .ok_or_else(|| StorageError::new(StorageErrorKind::NotFound, url))
    }

    async fn list_links(&self, path: &str) -> Result<Vec<String>, StorageError> {
        if self.links_hidden.load(Ordering::SeqCst) {
            return Ok(vec![]);
        }
        Ok(self.links.lock().unwrap().get(path).cloned().into_iter().collect())
    }
}
