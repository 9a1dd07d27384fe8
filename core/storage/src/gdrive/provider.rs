//! Google Drive storage provider implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use snapmatch_common::{Error, Result, StoragePath};

use crate::google::{AuthConfig, AuthManager, TokenManager, Tokens};
use crate::provider::{
    guess_content_type, ObjectMetadata, StorageObject, StorageProvider, UploadReceipt,
};
use crate::retry::RetryConfig;
use crate::throttle::ThrottledProvider;

use super::client::{DriveClient, DriveFile};

/// Upper bound for resolving a share link.
const URL_TIMEOUT: Duration = Duration::from_secs(10);

fn default_min_upload_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

/// Google Drive provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveConfig {
    /// Drive folder that plays the role of the storage root.
    pub folder_id: String,
    pub tokens: Tokens,
    #[serde(default)]
    pub auth_config: Option<AuthConfig>,
    /// Minimum spacing between consecutive uploads.
    #[serde(default = "default_min_upload_interval_ms")]
    pub min_upload_interval_ms: u64,
    /// Retries for rate-limited calls.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Google Drive storage provider.
///
/// Drive addresses files by ID and allows duplicate names, so virtual paths
/// are resolved folder by folder from the configured root and the mapping is
/// cached.
pub struct GDriveProvider {
    config: GDriveConfig,
    client: DriveClient,
    token_manager: Arc<TokenManager>,
    /// Virtual key to Drive file ID. The root is stored under "".
    path_cache: RwLock<HashMap<String, String>>,
    /// Serializes folder creation so concurrent uploads don't create twins.
    folder_lock: Mutex<()>,
}

impl GDriveProvider {
    /// Create a new Google Drive provider.
    ///
    /// No request is made until [`initialize`](StorageProvider::initialize).
    ///
    /// # Errors
    /// - `Configuration` if no OAuth client registration is available
    pub fn new(config: GDriveConfig) -> Result<Self> {
        let auth_config = AuthConfig::resolve(config.auth_config.clone())?;
        let auth_manager = AuthManager::new(auth_config)?;
        let token_manager = Arc::new(TokenManager::new(auth_manager, config.tokens.clone()));
        let client = DriveClient::new(token_manager.clone())?;

        let mut path_cache = HashMap::new();
        path_cache.insert(String::new(), config.folder_id.clone());

        Ok(Self {
            config,
            client,
            token_manager,
            path_cache: RwLock::new(path_cache),
            folder_lock: Mutex::new(()),
        })
    }

    /// Current tokens, for persisting after a refresh.
    pub async fn tokens(&self) -> Tokens {
        self.token_manager.tokens().await
    }

    async fn cached(&self, key: &str) -> Option<String> {
        self.path_cache.read().await.get(key).cloned()
    }

    async fn cache_path(&self, path: &StoragePath, file_id: &str) {
        self.path_cache
            .write()
            .await
            .insert(path.as_key(), file_id.to_string());
    }

    /// Drop `path` and everything cached beneath it.
    async fn invalidate(&self, path: &StoragePath) {
        let key = path.as_key();
        let prefix = path.as_prefix();
        self.path_cache
            .write()
            .await
            .retain(|k, _| k.is_empty() || (k != &key && !k.starts_with(&prefix)));
    }

    /// Resolve a virtual path to a Drive file ID.
    ///
    /// # Errors
    /// - `NotFound` if any component is missing
    async fn resolve_path(&self, path: &StoragePath) -> Result<String> {
        if let Some(id) = self.cached(&path.as_key()).await {
            return Ok(id);
        }

        let mut current_id = self.config.folder_id.clone();
        let mut current = StoragePath::root();

        for component in path.components() {
            current = current.join(component)?;
            if let Some(id) = self.cached(&current.as_key()).await {
                current_id = id;
                continue;
            }

            let file = self
                .client
                .find_child(component, &current_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))?;

            current_id = file.id;
            self.cache_path(&current, &current_id).await;
        }

        Ok(current_id)
    }

    /// Resolve a folder path, creating missing folders along the way.
    async fn ensure_folder(&self, path: &StoragePath) -> Result<String> {
        if let Some(id) = self.cached(&path.as_key()).await {
            return Ok(id);
        }

        let _guard = self.folder_lock.lock().await;
        let mut current_id = self.config.folder_id.clone();
        let mut current = StoragePath::root();

        for component in path.components() {
            current = current.join(component)?;
            if let Some(id) = self.cached(&current.as_key()).await {
                current_id = id;
                continue;
            }

            current_id = match self.client.find_child(component, &current_id).await? {
                Some(existing) if existing.is_folder() => existing.id,
                Some(_) => {
                    return Err(Error::AlreadyExists(format!(
                        "A file occupies folder path {}",
                        current
                    )))
                }
                None => {
                    debug!(path = %current, "Creating Drive folder");
                    self.client.create_folder(component, &current_id).await?.id
                }
            };
            self.cache_path(&current, &current_id).await;
        }

        Ok(current_id)
    }

    fn split_parent(path: &StoragePath) -> Result<(StoragePath, &str)> {
        match (path.parent(), path.name()) {
            (Some(parent), Some(name)) => Ok((parent, name)),
            _ => Err(Error::InvalidInput(format!(
                "Path has no file name: {}",
                path
            ))),
        }
    }

    fn to_object(file: &DriveFile, path: StoragePath) -> StorageObject {
        StorageObject {
            size_bytes: file.size_bytes(),
            content_type: file.mime_type.clone(),
            last_modified: file.modified_time.unwrap_or_else(Utc::now),
            provider_id: Some(file.id.clone()),
            path,
        }
    }

    async fn file_link(&self, path: &StoragePath) -> Result<String> {
        let file_id = self.resolve_path(path).await?;
        let file = self.client.get_file(&file_id).await?;
        file.link()
            .map(String::from)
            .ok_or_else(|| Error::Storage(format!("Drive returned no link for {}", path)))
    }
}

#[async_trait]
impl StorageProvider for GDriveProvider {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn initialize(&self) -> Result<()> {
        let root = match self.client.get_file(&self.config.folder_id).await {
            Ok(root) => root,
            Err(Error::NotFound(_)) => {
                return Err(Error::Configuration(format!(
                    "Drive folder {} does not exist or is not shared with this account",
                    self.config.folder_id
                )))
            }
            Err(e) => return Err(e),
        };
        if !root.is_folder() {
            return Err(Error::Configuration(format!(
                "Drive ID {} is not a folder",
                self.config.folder_id
            )));
        }

        info!(folder = %root.name, "Connected to Google Drive");
        Ok(())
    }

    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        let (parent, name) = Self::split_parent(path)?;
        let parent_id = self.ensure_folder(&parent).await?;
        let content_type = content_type
            .map(String::from)
            .unwrap_or_else(|| guess_content_type(path));

        let file = match self.client.find_child(name, &parent_id).await? {
            Some(existing) => {
                self.client
                    .update_file(&existing.id, data, &content_type)
                    .await?
            }
            None => {
                self.client
                    .create_file(name, &parent_id, data, &content_type)
                    .await?
            }
        };
        self.cache_path(path, &file.id).await;

        Ok(UploadReceipt {
            path: path.clone(),
            url: file.link().map(String::from),
            provider_id: Some(file.id),
        })
    }

    async fn download(&self, path: &StoragePath) -> Result<Vec<u8>> {
        let file_id = self.resolve_path(path).await?;
        self.client.download(&file_id).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<bool> {
        let file_id = match self.resolve_path(path).await {
            Ok(id) => id,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let deleted = match self.client.delete(&file_id).await {
            Ok(()) => true,
            Err(Error::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        self.invalidate(path).await;
        Ok(deleted)
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StorageObject>> {
        let root_id = match self.resolve_path(prefix).await {
            Ok(id) => id,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut results = Vec::new();
        let mut pending = vec![(root_id, prefix.clone())];

        while let Some((folder_id, folder_path)) = pending.pop() {
            for file in self.client.list_folder(&folder_id).await? {
                let child = folder_path.join(&file.name)?;
                self.cache_path(&child, &file.id).await;

                if file.is_folder() {
                    pending.push((file.id, child));
                } else {
                    results.push(Self::to_object(&file, child));
                }
            }
        }

        Ok(results)
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        match self.resolve_path(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<bool> {
        let from_id = match self.resolve_path(from).await {
            Ok(id) => id,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let (parent, name) = Self::split_parent(to)?;
        let parent_id = self.ensure_folder(&parent).await?;

        // Drive keeps duplicates side by side; drop the old target to overwrite.
        if let Some(existing) = self.client.find_child(name, &parent_id).await? {
            self.client.delete(&existing.id).await?;
        }

        let file = self.client.copy_file(&from_id, name, &parent_id).await?;
        self.cache_path(to, &file.id).await;
        Ok(true)
    }

    async fn metadata(&self, path: &StoragePath) -> Result<ObjectMetadata> {
        let file_id = self.resolve_path(path).await?;
        let file = self.client.get_file(&file_id).await?;
        Ok(ObjectMetadata {
            size_bytes: file.size_bytes(),
            content_type: file.mime_type,
            last_modified: file.modified_time.unwrap_or_else(Utc::now),
        })
    }

    /// Drive share links do not expire, so `ttl` is ignored.
    async fn url(&self, path: &StoragePath, _ttl: Duration) -> Result<String> {
        tokio::time::timeout(URL_TIMEOUT, self.file_link(path))
            .await
            .map_err(|_| Error::Timeout(format!("Resolving Drive link for {}", path)))?
    }
}

/// Create a Google Drive provider from configuration.
///
/// The provider is wrapped in a [`ThrottledProvider`] because Drive enforces
/// per-user write quotas.
pub fn create_gdrive_provider(config: serde_json::Value) -> Result<Arc<dyn StorageProvider>> {
    let config: GDriveConfig = serde_json::from_value(config)
        .map_err(|e| Error::Configuration(format!("Invalid gdrive config: {}", e)))?;

    let interval = Duration::from_millis(config.min_upload_interval_ms);
    let retry = RetryConfig::new(config.max_retries).with_initial_delay(Duration::from_secs(2));
    let provider = Arc::new(GDriveProvider::new(config)?);

    Ok(Arc::new(ThrottledProvider::new(provider, interval, retry)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> serde_json::Value {
        serde_json::json!({
            "folder_id": "root_folder",
            "tokens": {
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_at": "2099-01-01T00:00:00Z"
            },
            "auth_config": {
                "client_id": "client",
                "client_secret": "secret"
            }
        })
    }

    #[test]
    fn test_config_defaults() {
        let config: GDriveConfig = serde_json::from_value(test_config()).unwrap();
        assert_eq!(config.folder_id, "root_folder");
        assert_eq!(config.min_upload_interval_ms, 500);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_factory_wraps_provider() {
        let provider = create_gdrive_provider(test_config()).unwrap();
        assert_eq!(provider.name(), "gdrive");
    }

    #[test]
    fn test_factory_rejects_missing_fields() {
        let result = create_gdrive_provider(serde_json::json!({ "folder_id": "x" }));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_invalidate_drops_subtree() {
        let config: GDriveConfig = serde_json::from_value(test_config()).unwrap();
        let provider = GDriveProvider::new(config).unwrap();

        let folder = StoragePath::parse("events/e1/photos").unwrap();
        let file = folder.join("a.jpg").unwrap();
        let sibling = StoragePath::parse("events/e1/photos2").unwrap();
        provider.cache_path(&folder, "f").await;
        provider.cache_path(&file, "a").await;
        provider.cache_path(&sibling, "s").await;

        provider.invalidate(&folder).await;

        assert!(provider.cached(&folder.as_key()).await.is_none());
        assert!(provider.cached(&file.as_key()).await.is_none());
        assert_eq!(provider.cached(&sibling.as_key()).await.as_deref(), Some("s"));
        assert_eq!(provider.cached("").await.as_deref(), Some("root_folder"));
    }

    #[test]
    fn test_to_object() {
        let file = DriveFile {
            id: "file_id".to_string(),
            name: "a.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size: Some("1024".to_string()),
            modified_time: Some(Utc::now()),
            parents: vec!["parent".to_string()],
            md5_checksum: None,
            web_content_link: None,
            web_view_link: None,
        };
        let path = StoragePath::parse("events/e1/photos/a.jpg").unwrap();

        let object = GDriveProvider::to_object(&file, path.clone());

        assert_eq!(object.path, path);
        assert_eq!(object.size_bytes, 1024);
        assert_eq!(object.provider_id.as_deref(), Some("file_id"));
    }
}
