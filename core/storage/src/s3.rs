//! S3-compatible storage provider.
//!
//! The enterprise object-store backend: AWS S3, MinIO, Backblaze B2 and other
//! services speaking the S3 API. Credentials come explicitly from the
//! provider settings. Keys may live under an optional prefix so several
//! deployments can share a bucket.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use snapmatch_common::{Error, Result, StoragePath};

use crate::provider::{
    guess_content_type, ObjectMetadata, StorageObject, StorageProvider, UploadReceipt,
};

/// Characters left alone in `x-amz-copy-source`.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Presigned URLs are capped at seven days by S3.
const MAX_PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// S3 provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// AWS region or provider-specific region (e.g. "us-west-004" for Backblaze).
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for non-AWS services.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Key prefix acting as a virtual root directory.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Map an SDK failure onto the shared error vocabulary.
fn map_sdk_error<E>(err: SdkError<E>, context: &str) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("{}: {}", context, DisplayErrorContext(&err));

    match (&err, status) {
        (SdkError::ServiceError(_), Some(429 | 503)) => Error::RateLimited(message),
        (SdkError::ServiceError(_), Some(401 | 403)) => Error::PermissionDenied(message),
        (SdkError::ServiceError(_), Some(404)) => Error::NotFound(message),
        (SdkError::ServiceError(_), _) => Error::Storage(message),
        _ => Error::Network(message),
    }
}

fn to_chrono(dt: Option<&AwsDateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// S3-compatible storage provider.
#[derive(Debug, Clone)]
pub struct S3Provider {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Provider {
    /// # Errors
    /// - `Configuration` if the bucket or credentials are empty
    pub fn new(config: S3Config) -> Result<Self> {
        for (field, value) in [
            ("bucket", &config.bucket),
            ("region", &config.region),
            ("access_key_id", &config.access_key_id),
            ("secret_access_key", &config.secret_access_key),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("s3 {} must not be empty", field)));
            }
        }

        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "snapmatch-config",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region))
            // Path-style addressing works with every S3-compatible service.
            .force_path_style(true);
        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let prefix = config
            .prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            prefix,
        })
    }

    /// Full S3 key for a virtual path.
    fn full_key(&self, path: &StoragePath) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, path.as_key()),
            None => path.as_key(),
        }
    }

    /// Virtual path for an S3 key under the configured prefix.
    fn relative_path(&self, key: &str) -> Result<StoragePath> {
        let relative = match &self.prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|s| s.strip_prefix('/'))
                .unwrap_or(key),
            None => key,
        };
        StoragePath::parse(relative)
    }

    fn list_prefix(&self, prefix: &StoragePath) -> String {
        match (&self.prefix, prefix.is_root()) {
            (Some(root), true) => format!("{}/", root),
            (Some(root), false) => format!("{}/{}", root, prefix.as_prefix()),
            (None, _) => prefix.as_prefix(),
        }
    }

    fn copy_source(&self, path: &StoragePath) -> String {
        utf8_percent_encode(&format!("{}/{}", self.bucket, self.full_key(path)), COPY_SOURCE)
            .to_string()
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        "s3"
    }

    async fn initialize(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                Error::Authentication(format!(
                    "Cannot access bucket {}: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!(bucket = %self.bucket, prefix = ?self.prefix, "Connected to S3");
        Ok(())
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

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("Upload {}", path)))?;

        Ok(UploadReceipt {
            path: path.clone(),
            url: None,
            provider_id: output.e_tag().map(String::from),
        })
    }

    async fn download(&self, path: &StoragePath) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    Error::NotFound(format!("File not found: {}", path))
                } else {
                    map_sdk_error(e, &format!("Download {}", path))
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Network(format!("Failed to read {}: {}", path, e)))?;
        Ok(data.into_bytes().to_vec())
    }

    /// S3 deletes succeed for absent keys, so existence is checked first.
    async fn delete(&self, path: &StoragePath) -> Result<bool> {
        if !self.exists(path).await? {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("Delete {}", path)))?;
        Ok(true)
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StorageObject>> {
        let key_prefix = self.list_prefix(prefix);
        let mut results = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &format!("List {}", prefix)))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let path = self.relative_path(key)?;
                results.push(StorageObject {
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    content_type: guess_content_type(&path),
                    path,
                    last_modified: to_chrono(object.last_modified()),
                    provider_id: object.e_tag().map(String::from),
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(results)
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<bool> {
        if !self.exists(from).await? {
            return Ok(false);
        }

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(from))
            .key(self.full_key(to))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("Copy {} to {}", from, to)))?;
        Ok(true)
    }

    async fn metadata(&self, path: &StoragePath) -> Result<ObjectMetadata> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Error::NotFound(format!("Path not found: {}", path))
                } else {
                    map_sdk_error(e, &format!("Stat {}", path))
                }
            })?;

        Ok(ObjectMetadata {
            size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output
                .content_type()
                .map(String::from)
                .unwrap_or_else(|| guess_content_type(path)),
            last_modified: to_chrono(output.last_modified()),
        })
    }

    /// Presigned GET URL; computed locally, no request is made.
    async fn url(&self, path: &StoragePath, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl.min(MAX_PRESIGN_TTL))
            .map_err(|e| Error::InvalidInput(format!("Invalid URL lifetime: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .presigned(presigning)
            .await
            .map_err(|e| map_sdk_error(e, &format!("Presign {}", path)))?;

        Ok(request.uri().to_string())
    }
}

/// Create an S3 provider from configuration.
pub fn create_s3_provider(config: serde_json::Value) -> Result<Arc<dyn StorageProvider>> {
    let config: S3Config = serde_json::from_value(config)
        .map_err(|e| Error::Configuration(format!("Invalid s3 config: {}", e)))?;
    Ok(Arc::new(S3Provider::new(config)?))
}
