//! Storage provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use snapmatch_common::{Result, StoragePath};

/// A stored object as reported by a provider listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageObject {
    /// Virtual path, unique within a provider root.
    pub path: StoragePath,
    /// Size in bytes.
    pub size_bytes: u64,
    /// MIME type.
    pub content_type: String,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
    /// Provider-specific identifier (file ID, ETag, generation).
    pub provider_id: Option<String>,
}

/// Metadata for a single object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub path: StoragePath,
    /// Stable URL for the object, if the provider has one.
    pub url: Option<String>,
    pub provider_id: Option<String>,
}

/// Outcome of a best-effort bulk delete.
#[derive(Debug, Clone, Default)]
pub struct BulkDeleteReport {
    /// Objects that were removed.
    pub deleted: usize,
    /// Listed objects that were already gone when their delete ran.
    pub absent: usize,
    /// Objects that could not be removed, with the cause.
    pub failed: Vec<(StoragePath, String)>,
}

impl BulkDeleteReport {
    /// True when every listed object was removed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Guess a content type from a path's extension.
pub fn guess_content_type(path: &StoragePath) -> String {
    mime_guess::from_path(path.as_key())
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Storage provider trait for different backends.
///
/// Every provider exposes the same operation set. Implementations must be
/// safe for concurrent calls from multiple in-flight requests and handle
/// their own authentication.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "gdrive", "gcs", "s3").
    fn name(&self) -> &str;

    /// Establish the provider session.
    ///
    /// # Errors
    /// - `Authentication` if credentials are rejected
    async fn initialize(&self) -> Result<()>;

    /// Upload data, creating parent directories implicitly and overwriting
    /// any existing object at `path`.
    ///
    /// `content_type` is guessed from the path when absent.
    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt>;

    /// Download data from storage.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    async fn download(&self, path: &StoragePath) -> Result<Vec<u8>>;

    /// Delete an object. Returns `false` if it was already absent.
    async fn delete(&self, path: &StoragePath) -> Result<bool>;

    /// List every object under a prefix, recursively.
    ///
    /// Returns an empty vector for a prefix with no matches.
    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StorageObject>>;

    /// Check if an object exists.
    async fn exists(&self, path: &StoragePath) -> Result<bool>;

    /// Copy an object. Returns `false` if the source is absent.
    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<bool>;

    /// Move an object. Returns `false` if the source is absent.
    ///
    /// The default is `copy` followed by `delete(from)`. If the source cannot
    /// be removed the copy is rolled back, so the move never completes halfway.
    async fn move_object(&self, from: &StoragePath, to: &StoragePath) -> Result<bool> {
        if !self.copy(from, to).await? {
            return Ok(false);
        }
        if let Err(e) = self.delete(from).await {
            warn!(from = %from, to = %to, error = %e, "Move failed to remove source, rolling back copy");
            if let Err(rollback) = self.delete(to).await {
                warn!(path = %to, error = %rollback, "Failed to roll back copied object");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Get metadata for an object.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    async fn metadata(&self, path: &StoragePath) -> Result<ObjectMetadata>;

    /// Get a fetch URL for an object.
    ///
    /// Time-bounded by `ttl` when the provider supports signed links, a
    /// stable public URL otherwise. Must not block past a bounded timeout.
    async fn url(&self, path: &StoragePath, ttl: Duration) -> Result<String>;

    /// Delete every object under a prefix.
    ///
    /// Best-effort: a failed delete is logged and the remaining objects
    /// are still attempted.
    async fn delete_prefix(&self, prefix: &StoragePath) -> Result<BulkDeleteReport> {
        let objects = self.list(prefix).await?;
        let mut report = BulkDeleteReport::default();

        for object in objects {
            match self.delete(&object.path).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => report.absent += 1,
                Err(e) => {
                    warn!(provider = self.name(), path = %object.path, error = %e, "Failed to delete object");
                    report.failed.push((object.path, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_object_serialization() {
        let object = StorageObject {
            path: StoragePath::parse("events/e1/photos/a.jpg").unwrap(),
            size_bytes: 1024,
            content_type: "image/jpeg".to_string(),
            last_modified: Utc::now(),
            provider_id: Some("abc123".to_string()),
        };

        let json = serde_json::to_string(&object).unwrap();
        let deserialized: StorageObject = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.path, object.path);
        assert_eq!(deserialized.size_bytes, object.size_bytes);
        assert_eq!(deserialized.provider_id, object.provider_id);
    }

    #[test]
    fn test_guess_content_type() {
        let jpg = StoragePath::parse("a/b.jpg").unwrap();
        let zip = StoragePath::parse("a/b.zip").unwrap();
        let unknown = StoragePath::parse("a/b").unwrap();
        assert_eq!(guess_content_type(&jpg), "image/jpeg");
        assert_eq!(guess_content_type(&zip), "application/zip");
        assert_eq!(guess_content_type(&unknown), "application/octet-stream");
    }

    /// Lists two objects, one of which vanished before the delete.
    struct Stale;

    #[async_trait]
    impl StorageProvider for Stale {
        fn name(&self) -> &str {
            "stale"
        }
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn upload(&self, _: &StoragePath, _: Vec<u8>, _: Option<&str>) -> Result<UploadReceipt> {
            unimplemented!()
        }
        async fn download(&self, _: &StoragePath) -> Result<Vec<u8>> {
            unimplemented!()
        }
        async fn delete(&self, path: &StoragePath) -> Result<bool> {
            Ok(path.as_key() == "e/kept.jpg")
        }
        async fn list(&self, _: &StoragePath) -> Result<Vec<StorageObject>> {
            Ok(["e/kept.jpg", "e/gone.jpg"]
                .iter()
                .map(|key| StorageObject {
                    path: StoragePath::parse(key).unwrap(),
                    size_bytes: 1,
                    content_type: "image/jpeg".to_string(),
                    last_modified: Utc::now(),
                    provider_id: None,
                })
                .collect())
        }
        async fn exists(&self, _: &StoragePath) -> Result<bool> {
            unimplemented!()
        }
        async fn copy(&self, _: &StoragePath, _: &StoragePath) -> Result<bool> {
            unimplemented!()
        }
        async fn metadata(&self, _: &StoragePath) -> Result<ObjectMetadata> {
            unimplemented!()
        }
        async fn url(&self, _: &StoragePath, _: Duration) -> Result<String> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_delete_prefix_counts_absent_objects_separately() {
        let report = Stale.delete_prefix(&StoragePath::parse("e").unwrap()).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.absent, 1);
        assert!(report.is_complete());
    }

    #[test]
    fn test_bulk_delete_report_completeness() {
        let mut report = BulkDeleteReport::default();
        report.deleted = 3;
        assert!(report.is_complete());
        report
            .failed
            .push((StoragePath::parse("x").unwrap(), "boom".to_string()));
        assert!(!report.is_complete());
    }
}
