//! Upload intake: sanitize, store remotely, mirror locally.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use snapmatch_common::{EventId, EventLayout, RecipientId, Result, StoragePath};

use crate::ledger::DeliveryLedger;
use crate::sanitize::{sanitize_file_name, NameSequence};
use crate::sync::MirrorSync;

/// One uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub name: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

impl IncomingFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Where a batch goes: event photos, or a recipient's reference selfies.
#[derive(Debug, Clone)]
pub struct IntakeTarget {
    pub event: EventId,
    pub recipient: Option<RecipientId>,
}

impl IntakeTarget {
    pub fn photos(event: EventId) -> Self {
        Self {
            event,
            recipient: None,
        }
    }

    pub fn selfies(event: EventId, recipient: RecipientId) -> Self {
        Self {
            event,
            recipient: Some(recipient),
        }
    }
}

/// Result for a single file of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Stored {
        path: StoragePath,
        /// The remote upload succeeded.
        remote: bool,
        /// The local mirror copy was written.
        local: bool,
    },
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct FileReport {
    /// Name as sent by the client.
    pub original_name: String,
    pub outcome: FileOutcome,
}

impl FileReport {
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, FileOutcome::Stored { .. })
    }
}

/// Per-file results of one upload batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn accepted(&self) -> usize {
        self.files.iter().filter(|f| f.is_accepted()).count()
    }

    pub fn rejected(&self) -> usize {
        self.files.len() - self.accepted()
    }

    /// A batch succeeds when at least one file was accepted.
    pub fn is_success(&self) -> bool {
        self.accepted() > 0
    }

    /// Paths of the accepted files.
    pub fn stored_paths(&self) -> Vec<&StoragePath> {
        self.files
            .iter()
            .filter_map(|f| match &f.outcome {
                FileOutcome::Stored { path, .. } => Some(path),
                FileOutcome::Rejected(_) => None,
            })
            .collect()
    }
}

/// Receives uploaded files and stores them under the event layout.
pub struct UploadIntake {
    sync: MirrorSync,
    ledger: Arc<DeliveryLedger>,
    names: NameSequence,
}

impl UploadIntake {
    pub fn new(sync: MirrorSync, ledger: Arc<DeliveryLedger>) -> Self {
        Self::with_names(sync, ledger, NameSequence::new())
    }

    pub fn with_names(sync: MirrorSync, ledger: Arc<DeliveryLedger>, names: NameSequence) -> Self {
        Self {
            sync,
            ledger,
            names,
        }
    }

    /// Store a batch of files.
    ///
    /// Files are processed concurrently. For each file the remote upload
    /// happens before the local write, and a failed remote upload still
    /// produces the local copy.
    ///
    /// # Errors
    /// Only if the delivery ledger cannot be updated; per-file failures are
    /// reported in the [`BatchReport`].
    pub async fn upload_batch(&self, target: &IntakeTarget, files: Vec<IncomingFile>) -> Result<BatchReport> {
        let layout = EventLayout::new(target.event.clone());

        let reports = join_all(
            files
                .into_iter()
                .map(|file| self.store_one(&layout, target.recipient.as_ref(), file)),
        )
        .await;
        let report = BatchReport { files: reports };

        let accepted = report.accepted() as u32;
        if accepted > 0 {
            let now = Utc::now();
            match &target.recipient {
                Some(recipient) => {
                    self.ledger
                        .record_source(&target.event, recipient, accepted, now)
                        .await?
                }
                None => {
                    self.ledger
                        .record_input_change_for_event(&target.event, now)
                        .await?;
                }
            }
        }

        info!(
            event = %target.event,
            recipient = target.recipient.as_ref().map(|r| r.as_str()),
            accepted = report.accepted(),
            rejected = report.rejected(),
            "Upload batch stored"
        );
        Ok(report)
    }

    async fn store_one(
        &self,
        layout: &EventLayout,
        recipient: Option<&RecipientId>,
        file: IncomingFile,
    ) -> FileReport {
        let original_name = file.name.clone();
        let outcome = self.store_file(layout, recipient, file).await;
        FileReport {
            original_name,
            outcome,
        }
    }

    async fn store_file(
        &self,
        layout: &EventLayout,
        recipient: Option<&RecipientId>,
        file: IncomingFile,
    ) -> FileOutcome {
        if file.data.is_empty() {
            return FileOutcome::Rejected("File is empty".to_string());
        }

        let name = self.names.disambiguate(&sanitize_file_name(&file.name));
        let path = match recipient {
            Some(recipient) => layout.selfie(recipient, &name),
            None => layout.photo(&name),
        };
        let path = match path {
            Ok(path) => path,
            Err(e) => return FileOutcome::Rejected(e.to_string()),
        };

        let mut remote = false;
        let mut remote_error = None;
        if let Some(provider) = self.sync.remote() {
            match provider
                .upload(&path, file.data.clone(), file.content_type.as_deref())
                .await
            {
                Ok(_) => remote = true,
                Err(e) => {
                    warn!(path = %path, error = %e, "Remote upload failed, keeping local copy");
                    remote_error = Some(e.to_string());
                }
            }
        }

        let local = match self.sync.sync_down_buffered(&path, &file.data).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path, error = %e, "Local mirror write failed");
                if !remote {
                    let cause = match remote_error {
                        Some(remote_error) => format!("{}; local: {}", remote_error, e),
                        None => e.to_string(),
                    };
                    return FileOutcome::Rejected(cause);
                }
                false
            }
        };

        debug!(path = %path, remote, local, "Stored upload");
        FileOutcome::Stored {
            path,
            remote,
            local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::LocalMirror;
    use snapmatch_storage::{MemoryProvider, Operation, StorageMode, StorageProvider};
    use tempfile::TempDir;

    fn path(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    fn event() -> EventId {
        EventId::new("e1").unwrap()
    }

    struct Fixture {
        _temp: TempDir,
        provider: Arc<MemoryProvider>,
        ledger: Arc<DeliveryLedger>,
        intake: UploadIntake,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let ledger = Arc::new(DeliveryLedger::in_memory());
        let sync = MirrorSync::new(
            Arc::new(LocalMirror::new(temp.path())),
            StorageMode::Remote(provider.clone()),
        );
        let intake = UploadIntake::with_names(sync, ledger.clone(), NameSequence::starting_at(1));
        Fixture {
            _temp: temp,
            provider,
            ledger,
            intake,
        }
    }

    #[tokio::test]
    async fn test_photos_stored_remote_and_local() {
        let f = fixture();
        let report = f
            .intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![IncomingFile::new("IMG 01.JPG", vec![1, 2, 3])],
            )
            .await
            .unwrap();

        assert!(report.is_success());
        let stored = path("events/e1/photos/1_IMG 01.jpg");
        assert_eq!(report.stored_paths(), vec![&stored]);
        assert_eq!(f.provider.download(&stored).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(f.intake.sync.mirror().read(&stored).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_selfies_update_ledger() {
        let f = fixture();
        let bob = RecipientId::new("bob").unwrap();

        let report = f
            .intake
            .upload_batch(
                &IntakeTarget::selfies(event(), bob.clone()),
                vec![
                    IncomingFile::new("bob@example.com.jpg", vec![1]),
                    IncomingFile::new("me.png", vec![2]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.accepted(), 2);
        assert!(f
            .provider
            .exists(&path("events/e1/selfies/bob/1_photo.jpg"))
            .await
            .unwrap());
        let record = f.ledger.get(&event(), &bob).await.unwrap();
        assert_eq!(record.source_count, 2);
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn test_remote_failure_still_mirrors_locally() {
        let f = fixture();
        let target = path("events/e1/photos/1_a.jpg");
        f.provider.fail_on(Operation::Upload, &target);

        let report = f
            .intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![IncomingFile::new("a.jpg", vec![7])],
            )
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(
            report.files[0].outcome,
            FileOutcome::Stored {
                path: target.clone(),
                remote: false,
                local: true
            }
        );
        assert!(!f.provider.exists(&target).await.unwrap());
        assert_eq!(f.intake.sync.mirror().read(&target).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_empty_files_rejected_per_file() {
        let f = fixture();
        let report = f
            .intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![
                    IncomingFile::new("empty.jpg", Vec::new()),
                    IncomingFile::new("ok.jpg", vec![1]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.accepted(), 1);
        assert_eq!(report.rejected(), 1);
        assert!(matches!(report.files[0].outcome, FileOutcome::Rejected(_)));
        assert_eq!(report.files[0].original_name, "empty.jpg");
    }

    #[tokio::test]
    async fn test_all_rejected_is_failure() {
        let f = fixture();
        let report = f
            .intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![IncomingFile::new("empty.jpg", Vec::new())],
            )
            .await
            .unwrap();
        assert!(!report.is_success());
        assert!(!f.intake.upload_batch(&IntakeTarget::photos(event()), Vec::new()).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_same_name_gets_distinct_paths() {
        let f = fixture();
        let report = f
            .intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![
                    IncomingFile::new("dup.jpg", vec![1]),
                    IncomingFile::new("dup.jpg", vec![2]),
                ],
            )
            .await
            .unwrap();

        let paths = report.stored_paths();
        assert_eq!(paths.len(), 2);
        assert_ne!(paths[0], paths[1]);
    }

    #[tokio::test]
    async fn test_photos_mark_existing_recipients_pending() {
        let f = fixture();
        let bob = RecipientId::new("bob").unwrap();
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        f.ledger.record_source(&event(), &bob, 1, t0).await.unwrap();
        f.ledger.mark_processed(&event(), &bob, 1, 0, t0).await.unwrap();
        assert!(!f.ledger.is_pending(&event(), &bob).await);

        f.intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![IncomingFile::new("new.jpg", vec![1])],
            )
            .await
            .unwrap();

        assert!(f.ledger.is_pending(&event(), &bob).await);
    }

    #[tokio::test]
    async fn test_local_only_mode() {
        let temp = TempDir::new().unwrap();
        let sync = MirrorSync::new(Arc::new(LocalMirror::new(temp.path())), StorageMode::LocalOnly);
        let intake = UploadIntake::with_names(
            sync,
            Arc::new(DeliveryLedger::in_memory()),
            NameSequence::starting_at(5),
        );

        let report = intake
            .upload_batch(
                &IntakeTarget::photos(event()),
                vec![IncomingFile::new("a.jpg", vec![1])],
            )
            .await
            .unwrap();

        assert_eq!(
            report.files[0].outcome,
            FileOutcome::Stored {
                path: path("events/e1/photos/5_a.jpg"),
                remote: false,
                local: true
            }
        );
    }
}
