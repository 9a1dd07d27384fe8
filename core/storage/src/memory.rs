//! In-memory storage provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::provider::{
    guess_content_type, ObjectMetadata, StorageObject, StorageProvider, UploadReceipt,
};
use snapmatch_common::{Error, Result, StoragePath};

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Upload,
    Download,
    Delete,
    List,
    Copy,
    Metadata,
}

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    content_type: String,
    modified: DateTime<Utc>,
    id: String,
}

impl Entry {
    fn new(data: Vec<u8>, content_type: String) -> Self {
        Self {
            data,
            content_type,
            modified: Utc::now(),
            id: Uuid::new_v4().to_string(),
        }
    }

    fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            size_bytes: self.data.len() as u64,
            content_type: self.content_type.clone(),
            last_modified: self.modified,
        }
    }
}

/// In-memory storage provider.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Objects are kept in a flat key space, the same way
/// bucket-style stores model "directories".
///
/// Failures can be injected per operation and path with [`fail_on`](Self::fail_on).
pub struct MemoryProvider {
    storage: Arc<RwLock<BTreeMap<String, Entry>>>,
    failures: RwLock<HashSet<(Operation, String)>>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(BTreeMap::new())),
            failures: RwLock::new(HashSet::new()),
        }
    }

    /// Make every future `operation` on `path` fail with a network error.
    pub fn fail_on(&self, operation: Operation, path: &StoragePath) {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((operation, path.as_key()));
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn check(&self, operation: Operation, path: &StoragePath) -> Result<()> {
        let failures = self.failures.read().unwrap_or_else(|e| e.into_inner());
        if failures.contains(&(operation, path.as_key())) {
            return Err(Error::Network(format!(
                "Injected {:?} failure for {}",
                operation, path
            )));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.storage.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.storage.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        self.check(Operation::Upload, path)?;
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot upload to root".to_string()));
        }

        let content_type = content_type
            .map(String::from)
            .unwrap_or_else(|| guess_content_type(path));
        let entry = Entry::new(data, content_type);
        let id = entry.id.clone();
        self.write().insert(path.as_key(), entry);

        Ok(UploadReceipt {
            path: path.clone(),
            url: Some(format!("memory://{}", path.as_key())),
            provider_id: Some(id),
        })
    }

    async fn download(&self, path: &StoragePath) -> Result<Vec<u8>> {
        self.check(Operation::Download, path)?;
        self.read()
            .get(&path.as_key())
            .map(|entry| entry.data.clone())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))
    }

    async fn delete(&self, path: &StoragePath) -> Result<bool> {
        self.check(Operation::Delete, path)?;
        Ok(self.write().remove(&path.as_key()).is_some())
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StorageObject>> {
        self.check(Operation::List, prefix)?;
        let key_prefix = prefix.as_prefix();
        let storage = self.read();

        let mut results = Vec::new();
        for (key, entry) in storage.range(key_prefix.clone()..) {
            if !key.starts_with(&key_prefix) {
                break;
            }
            let path = StoragePath::parse(key)?;
            results.push(StorageObject {
                path,
                size_bytes: entry.data.len() as u64,
                content_type: entry.content_type.clone(),
                last_modified: entry.modified,
                provider_id: Some(entry.id.clone()),
            });
        }

        Ok(results)
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        Ok(self.read().contains_key(&path.as_key()))
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<bool> {
        self.check(Operation::Copy, from)?;
        let mut storage = self.write();
        let Some(source) = storage.get(&from.as_key()) else {
            return Ok(false);
        };
        let entry = Entry::new(source.data.clone(), source.content_type.clone());
        storage.insert(to.as_key(), entry);
        Ok(true)
    }

    async fn metadata(&self, path: &StoragePath) -> Result<ObjectMetadata> {
        self.check(Operation::Metadata, path)?;
        self.read()
            .get(&path.as_key())
            .map(Entry::metadata)
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }

    async fn url(&self, path: &StoragePath, ttl: Duration) -> Result<String> {
        if !self.exists(path).await? {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }
        Ok(format!(
            "memory://{}?expires_in={}",
            path.as_key(),
            ttl.as_secs()
        ))
    }
}
