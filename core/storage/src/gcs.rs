//! Google Cloud Storage provider.
//!
//! The bucket-style backend. Talks to the GCS JSON API directly with the
//! same OAuth token handling as the Drive provider. Object keys are the
//! virtual path keys; "directories" exist only as key prefixes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use snapmatch_common::{Error, Result, StoragePath};

use crate::google::{check_response, http_client, AuthConfig, AuthManager, TokenManager, Tokens};
use crate::provider::{
    guess_content_type, ObjectMetadata, StorageObject, StorageProvider, UploadReceipt,
};

const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
const GCS_PUBLIC_BASE: &str = "https://storage.googleapis.com";

/// Object names go into a single path segment, so even '/' is escaped.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');
/// Public URLs keep '/' between key components.
const PUBLIC_PATH: &AsciiSet = &OBJECT_NAME.remove(b'/');

/// GCS provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsConfig {
    pub bucket: String,
    pub tokens: Tokens,
    #[serde(default)]
    pub auth_config: Option<AuthConfig>,
    /// Base for public URLs, e.g. a CDN in front of the bucket.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// Object resource as returned by the JSON API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    /// Decimal string.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    generation: Option<String>,
}

impl GcsObject {
    fn size_bytes(&self) -> u64 {
        self.size.as_ref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    fn content_type(&self) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    fn into_storage_object(self) -> Result<StorageObject> {
        Ok(StorageObject {
            path: StoragePath::parse(&self.name)?,
            size_bytes: self.size_bytes(),
            content_type: self.content_type(),
            last_modified: self.updated.unwrap_or_else(Utc::now),
            provider_id: self.generation,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google Cloud Storage provider.
pub struct GcsProvider {
    config: GcsConfig,
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl GcsProvider {
    /// # Errors
    /// - `Configuration` if the bucket is empty or no OAuth client is available
    pub fn new(config: GcsConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(Error::Configuration("gcs bucket must not be empty".to_string()));
        }
        if let Some(base) = &config.public_base_url {
            let parsed = url::Url::parse(base).map_err(|e| {
                Error::Configuration(format!("Invalid gcs public_base_url '{}': {}", base, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::Configuration(format!(
                    "gcs public_base_url must be http(s): {}",
                    base
                )));
            }
        }

        let auth_manager = AuthManager::new(AuthConfig::resolve(config.auth_config.clone())?)?;
        let token_manager = Arc::new(TokenManager::new(auth_manager, config.tokens.clone()));

        Ok(Self {
            config,
            http: http_client()?,
            token_manager,
        })
    }

    fn object_url(&self, path: &StoragePath) -> String {
        format!(
            "{}/b/{}/o/{}",
            GCS_API_BASE,
            self.config.bucket,
            utf8_percent_encode(&path.as_key(), OBJECT_NAME)
        )
    }

    fn public_url(&self, path: &StoragePath) -> String {
        let key = utf8_percent_encode(&path.as_key(), PUBLIC_PATH).to_string();
        match &self.config.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("{}/{}/{}", GCS_PUBLIC_BASE, self.config.bucket, key),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> Result<reqwest::Response> {
        let token = self.token_manager.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{}: {}", context, e)))?;

        let result = check_response(response, context).await;
        if let Err(Error::Authentication(_)) = &result {
            self.token_manager.invalidate().await;
        }
        result
    }

    async fn get_object(&self, path: &StoragePath) -> Result<GcsObject> {
        let context = format!("Get object {}", path);
        self.send(self.http.get(self.object_url(path)), &context)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(format!("{}: {}", context, e)))
    }
}

#[async_trait]
impl StorageProvider for GcsProvider {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/b/{}", GCS_API_BASE, self.config.bucket);
        match self.send(self.http.get(url), "Get bucket").await {
            Ok(_) => {
                info!(bucket = %self.config.bucket, "Connected to Cloud Storage");
                Ok(())
            }
            Err(Error::NotFound(_)) => Err(Error::Configuration(format!(
                "Bucket {} does not exist",
                self.config.bucket
            ))),
            Err(e) => Err(e),
        }
    }

    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot upload to root".to_string()));
        }
        let content_type = content_type
            .map(String::from)
            .unwrap_or_else(|| guess_content_type(path));
        let key = path.as_key();

        let request = self
            .http
            .post(format!("{}/b/{}/o", GCS_UPLOAD_BASE, self.config.bucket))
            .query(&[("uploadType", "media"), ("name", key.as_str())])
            .header(header::CONTENT_TYPE, content_type)
            .body(data);

        let context = format!("Upload {}", path);
        let object: GcsObject = self
            .send(request, &context)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(format!("{}: {}", context, e)))?;

        Ok(UploadReceipt {
            path: path.clone(),
            url: Some(self.public_url(path)),
            provider_id: object.generation,
        })
    }

    async fn download(&self, path: &StoragePath) -> Result<Vec<u8>> {
        let request = self
            .http
            .get(self.object_url(path))
            .query(&[("alt", "media")]);

        self.send(request, &format!("Download {}", path))
            .await?
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Network(format!("Failed to read {}: {}", path, e)))
    }

    async fn delete(&self, path: &StoragePath) -> Result<bool> {
        match self
            .send(self.http.delete(self.object_url(path)), &format!("Delete {}", path))
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StorageObject>> {
        let key_prefix = prefix.as_prefix();
        let url = format!("{}/b/{}/o", GCS_API_BASE, self.config.bucket);
        let mut results = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .query(&[("prefix", key_prefix.as_str()), ("maxResults", "1000")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: ObjectList = self
                .send(request, "List objects")
                .await?
                .json()
                .await
                .map_err(|e| Error::Network(format!("List objects: {}", e)))?;

            for object in page.items {
                results.push(object.into_storage_object()?);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(results)
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        match self.get_object(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<bool> {
        let url = format!(
            "{}/copyTo/b/{}/o/{}",
            self.object_url(from),
            self.config.bucket,
            utf8_percent_encode(&to.as_key(), OBJECT_NAME)
        );

        match self
            .send(self.http.post(url), &format!("Copy {} to {}", from, to))
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn metadata(&self, path: &StoragePath) -> Result<ObjectMetadata> {
        let object = self.get_object(path).await?;
        Ok(ObjectMetadata {
            size_bytes: object.size_bytes(),
            content_type: object.content_type(),
            last_modified: object.updated.unwrap_or_else(Utc::now),
        })
    }

    /// Objects are served from the public endpoint; `ttl` does not apply.
    async fn url(&self, path: &StoragePath, _ttl: Duration) -> Result<String> {
        Ok(self.public_url(path))
    }
}

/// Create a Cloud Storage provider from configuration.
pub fn create_gcs_provider(config: serde_json::Value) -> Result<Arc<dyn StorageProvider>> {
    let config: GcsConfig = serde_json::from_value(config)
        .map_err(|e| Error::Configuration(format!("Invalid gcs config: {}", e)))?;
    Ok(Arc::new(GcsProvider::new(config)?))
}
