//! Facade used by the HTTP layer and the CLI.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use snapmatch_common::{Error, EventId, EventLayout, RecipientId, Result, StoragePath};
use snapmatch_jobs::{DeliveryNotifier, JobHandle, JobOrchestrator, LogNotifier, ProcessingJob};
use snapmatch_storage::{create_default_registry, BulkDeleteReport, ProviderRegistry, StorageMode};
use snapmatch_sync::{
    BatchReport, DeliveryLedger, IncomingFile, IntakeTarget, LocalMirror, MirrorSync,
    RecipientDeliveryRecord, UploadIntake,
};

use crate::config::AppConfig;

/// Where an object can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLocation {
    /// Link served by the remote provider.
    Url(String),
    /// File in the local mirror.
    LocalFile(PathBuf),
}

/// Outcome of [`EventService::delete_event`].
#[derive(Debug, Default)]
pub struct EventDeletion {
    /// `None` in local-only mode or when listing the remote prefix failed.
    pub remote: Option<BulkDeleteReport>,
    pub local_removed: bool,
    pub records_removed: usize,
}

/// Wires storage, mirror, intake, ledger and orchestrator together.
pub struct EventService {
    config: AppConfig,
    sync: MirrorSync,
    ledger: Arc<DeliveryLedger>,
    intake: UploadIntake,
    orchestrator: JobOrchestrator,
}

impl EventService {
    /// Connect storage with the built-in providers and open the ledger.
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        Self::bootstrap_with(config, &create_default_registry(), Arc::new(LogNotifier)).await
    }

    /// Like [`bootstrap`](Self::bootstrap) with a custom registry and notifier.
    pub async fn bootstrap_with(
        config: AppConfig,
        registry: &ProviderRegistry,
        notifier: Arc<dyn DeliveryNotifier>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = StorageMode::connect(registry, &config.storage).await?;

        let mirror = Arc::new(LocalMirror::new(&config.mirror_root));
        mirror.ensure_dir(&StoragePath::root()).await?;
        let ledger = Arc::new(DeliveryLedger::open(config.ledger_path()).await?);

        let sync = MirrorSync::new(mirror, storage);
        let intake = UploadIntake::new(sync.clone(), ledger.clone());
        let orchestrator = JobOrchestrator::new(
            sync.clone(),
            ledger.clone(),
            notifier,
            config.matcher.command(),
        );

        info!(
            mirror = %config.mirror_root.display(),
            storage = ?sync.storage(),
            "SnapMatch ready"
        );
        Ok(Self {
            config,
            sync,
            ledger,
            intake,
            orchestrator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageMode {
        self.sync.storage()
    }

    pub async fn upload(&self, target: &IntakeTarget, files: Vec<IncomingFile>) -> Result<BatchReport> {
        self.intake.upload_batch(target, files).await
    }

    /// Start a matcher job. Rejections carry the failed precondition.
    pub async fn trigger_processing(&self, event: &EventId) -> Result<JobHandle> {
        self.orchestrator.trigger(event).await
    }

    pub fn status(&self, event: &EventId) -> Option<ProcessingJob> {
        self.orchestrator.status(event)
    }

    /// Object bytes from remote storage, falling back to the local mirror.
    pub async fn fetch(&self, path: &StoragePath) -> Result<Vec<u8>> {
        if let Some(remote) = self.sync.remote() {
            match remote.download(path).await {
                Ok(data) => return Ok(data),
                Err(e) => warn!(path = %path, error = %e, "Remote fetch failed, trying local mirror"),
            }
        }
        self.sync.mirror().read(path).await
    }

    /// Link to an object, or the local file when no link can be produced.
    ///
    /// # Errors
    /// - `NotFound` if neither remote storage nor the mirror has the object
    pub async fn locate(&self, path: &StoragePath) -> Result<ObjectLocation> {
        if let Some(remote) = self.sync.remote() {
            match remote.url(path, self.config.url_ttl()).await {
                Ok(url) => return Ok(ObjectLocation::Url(url)),
                Err(e) => warn!(path = %path, error = %e, "Remote link unavailable, trying local mirror"),
            }
        }

        let mirror = self.sync.mirror();
        if mirror.stat(path).await?.is_some() {
            return Ok(ObjectLocation::LocalFile(mirror.to_fs_path(path)));
        }
        Err(Error::NotFound(format!("Object not found: {}", path)))
    }

    pub async fn is_pending(&self, event: &EventId, recipient: &RecipientId) -> bool {
        self.ledger.is_pending(event, recipient).await
    }

    pub async fn pending(&self, event: &EventId) -> Vec<RecipientId> {
        self.ledger.pending_recipients(event).await
    }

    pub async fn deliveries(&self, event: &EventId) -> Vec<RecipientDeliveryRecord> {
        self.ledger.records(event).await
    }

    /// Remove an event everywhere: remote objects, mirror tree, ledger.
    ///
    /// # Errors
    /// - `Precondition` while a job is running for the event
    pub async fn delete_event(&self, event: &EventId) -> Result<EventDeletion> {
        // Held until the event is gone so no job can start on a half-deleted tree.
        let _slot = self.orchestrator.reserve(event).map_err(|_| {
            Error::Precondition(format!(
                "Cannot delete event {} while a job is running",
                event
            ))
        })?;

        let layout = EventLayout::new(event.clone());
        let mut deletion = EventDeletion::default();

        if let Some(remote) = self.sync.remote() {
            match remote.delete_prefix(layout.root()).await {
                Ok(report) => {
                    if !report.is_complete() {
                        warn!(event = %event, failed = report.failed.len(), "Some remote objects were not deleted");
                    }
                    deletion.remote = Some(report);
                }
                Err(e) => warn!(event = %event, error = %e, "Remote delete failed"),
            }
        }

        deletion.local_removed = self.sync.mirror().remove_dir(layout.root()).await?;
        deletion.records_removed = self.ledger.remove_event(event).await?;

        info!(
            event = %event,
            remote_deleted = deletion.remote.as_ref().map(|r| r.deleted),
            local_removed = deletion.local_removed,
            "Event deleted"
        );
        Ok(deletion)
    }
}
