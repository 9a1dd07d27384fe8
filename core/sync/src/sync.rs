//! Reconciliation between the remote store and the local mirror.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use snapmatch_common::{EventLayout, Result, StoragePath};
use snapmatch_storage::{StorageMode, StorageProvider};

use crate::mirror::LocalMirror;

/// Aggregate outcome of a sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Files copied in this pass.
    pub synced: usize,
    /// Files already up to date.
    pub skipped: usize,
    /// Files that could not be copied, with the cause.
    pub failed: Vec<(StoragePath, String)>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, path: StoragePath, error: impl ToString) {
        self.failed.push((path, error.to_string()));
    }
}

/// Moves bytes between the active provider and the local mirror.
///
/// In local-only mode every remote-facing operation is a no-op.
#[derive(Clone)]
pub struct MirrorSync {
    mirror: Arc<LocalMirror>,
    storage: StorageMode,
}

impl MirrorSync {
    pub fn new(mirror: Arc<LocalMirror>, storage: StorageMode) -> Self {
        Self { mirror, storage }
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    pub fn storage(&self) -> &StorageMode {
        &self.storage
    }

    /// The active remote provider, if any.
    pub fn remote(&self) -> Option<&Arc<dyn StorageProvider>> {
        self.storage.provider()
    }

    /// Mirror a freshly uploaded object from the bytes already in memory.
    pub async fn sync_down_buffered(&self, path: &StoragePath, data: &[u8]) -> Result<()> {
        self.mirror.write(path, data).await
    }

    /// Mirror a remote object by downloading it.
    ///
    /// Returns `false` in local-only mode.
    pub async fn sync_down(&self, path: &StoragePath) -> Result<bool> {
        let Some(remote) = self.remote() else {
            return Ok(false);
        };
        let data = remote.download(path).await?;
        self.mirror.write(path, &data).await?;
        Ok(true)
    }

    /// Fetch every remote object of an event that is missing locally or
    /// differs in size.
    ///
    /// # Errors
    /// Only if the remote listing itself fails; per-file failures are
    /// reported in the [`SyncReport`].
    pub async fn sync_down_event(&self, layout: &EventLayout) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let Some(remote) = self.remote() else {
            return Ok(report);
        };

        // Exports are derived locally and rebuilt after every job.
        let exports = layout.exports();
        let objects = remote.list(layout.root()).await?;

        for object in objects {
            if object.path.starts_with(&exports) {
                continue;
            }

            match self.mirror.stat(&object.path).await {
                Ok(Some(local)) if local.size_bytes == object.size_bytes => {
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %object.path, error = %e, "Cannot stat local copy");
                    report.fail(object.path, e);
                    continue;
                }
            }

            match self.sync_down(&object.path).await {
                Ok(_) => {
                    debug!(path = %object.path, "Synced down");
                    report.synced += 1;
                }
                Err(e) => {
                    warn!(path = %object.path, error = %e, "Failed to sync down");
                    report.fail(object.path, e);
                }
            }
        }

        info!(
            event = %layout.event(),
            synced = report.synced,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Sync-down complete"
        );
        Ok(report)
    }

    /// Upload matched output whose remote counterpart is missing or older.
    ///
    /// Files are uploaded one at a time.
    pub async fn sync_up_matched(&self, layout: &EventLayout) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let Some(remote) = self.remote() else {
            return Ok(report);
        };

        let matched_root = layout.matched_root();
        let remote_index: HashMap<StoragePath, _> = remote
            .list(&matched_root)
            .await?
            .into_iter()
            .map(|object| (object.path.clone(), object))
            .collect();

        for local in self.mirror.list_files(&matched_root).await? {
            let up_to_date = remote_index
                .get(&local.path)
                .is_some_and(|object| object.last_modified >= local.modified);
            if up_to_date {
                report.skipped += 1;
                continue;
            }

            let data = match self.mirror.read(&local.path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %local.path, error = %e, "Failed to read matched file");
                    report.fail(local.path, e);
                    continue;
                }
            };

            match remote.upload(&local.path, data, None).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    warn!(path = %local.path, error = %e, "Failed to sync up");
                    report.fail(local.path, e);
                }
            }
        }

        info!(
            event = %layout.event(),
            synced = report.synced,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Sync-up complete"
        );
        Ok(report)
    }
}
