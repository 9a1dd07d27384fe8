//! Pacing and rate-limit backoff for providers with strict request quotas.
//!
//! [`ThrottledProvider`] wraps any [`StorageProvider`] so that callers stay
//! provider-agnostic: consecutive uploads issued from this process are spaced
//! by a minimum interval, and calls the provider rejects as rate limited are
//! retried with exponential backoff. Every other error passes through.
//!
//! Moves and bulk deletes use the trait defaults, so each of their steps goes
//! through the decorator.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::provider::{ObjectMetadata, StorageObject, StorageProvider, UploadReceipt};
use crate::retry::{RetryConfig, RetryExecutor};
use snapmatch_common::{Error, Result, StoragePath};

fn is_rate_limited(err: &Error) -> bool {
    matches!(err, Error::RateLimited(_))
}

/// Decorator enforcing upload pacing and rate-limit backoff.
pub struct ThrottledProvider {
    inner: Arc<dyn StorageProvider>,
    min_upload_interval: Duration,
    /// Earliest instant the next upload may be issued.
    next_upload: Mutex<Option<Instant>>,
    retry: RetryExecutor,
}

impl ThrottledProvider {
    pub fn new(
        inner: Arc<dyn StorageProvider>,
        min_upload_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner,
            min_upload_interval,
            next_upload: Mutex::new(None),
            retry: RetryExecutor::new(retry),
        }
    }

    /// Wait for this upload's slot.
    ///
    /// The lock is held while sleeping so concurrent callers queue up and
    /// each gets its own slot.
    async fn wait_for_upload_slot(&self) {
        let mut next = self.next_upload.lock().await;
        if let Some(at) = *next {
            if at > Instant::now() {
                debug!(provider = self.inner.name(), "Pacing upload");
                sleep_until(at).await;
            }
        }
        *next = Some(Instant::now() + self.min_upload_interval);
    }
}

#[async_trait]
impl StorageProvider for ThrottledProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initialize(&self) -> Result<()> {
        self.retry
            .execute_with_condition(|| self.inner.initialize(), is_rate_limited)
            .await
    }

    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt> {
        self.retry
            .execute_with_condition(
                || {
                    let data = data.clone();
                    async move {
                        self.wait_for_upload_slot().await;
                        self.inner.upload(path, data, content_type).await
                    }
                },
                is_rate_limited,
            )
            .await
    }

    async fn download(&self, path: &StoragePath) -> Result<Vec<u8>> {
        self.retry
            .execute_with_condition(|| self.inner.download(path), is_rate_limited)
            .await
    }

    async fn delete(&self, path: &StoragePath) -> Result<bool> {
        self.retry
            .execute_with_condition(|| self.inner.delete(path), is_rate_limited)
            .await
    }

    async fn list(&self, prefix: &StoragePath) -> Result<Vec<StorageObject>> {
        self.retry
            .execute_with_condition(|| self.inner.list(prefix), is_rate_limited)
            .await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.retry
            .execute_with_condition(|| self.inner.exists(path), is_rate_limited)
            .await
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<bool> {
        self.retry
            .execute_with_condition(|| self.inner.copy(from, to), is_rate_limited)
            .await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<ObjectMetadata> {
        self.retry
            .execute_with_condition(|| self.inner.metadata(path), is_rate_limited)
            .await
    }

    async fn url(&self, path: &StoragePath, ttl: Duration) -> Result<String> {
        self.retry
            .execute_with_condition(|| self.inner.url(path, ttl), is_rate_limited)
            .await
    }
}
