//! Delivery notification hook.

use async_trait::async_trait;
use tracing::info;

use snapmatch_common::{EventId, Result};

use crate::export::PackagedExport;

/// Told about each archive produced by a successful job.
///
/// Sending the actual message (email, webhook) is left to the host
/// application.
#[async_trait]
pub trait DeliveryNotifier: Send + Sync {
    async fn notify(&self, event: &EventId, export: &PackagedExport) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl DeliveryNotifier for LogNotifier {
    async fn notify(&self, event: &EventId, export: &PackagedExport) -> Result<()> {
        info!(
            event = %event,
            recipient = %export.recipient,
            files = export.file_count,
            archive = %export.path,
            "Delivery ready"
        );
        Ok(())
    }
}
