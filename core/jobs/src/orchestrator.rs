//! Job orchestration: preconditions, supervised run, post-processing.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use snapmatch_common::{is_image_name, Error, EventId, EventLayout, RecipientId, Result};
use snapmatch_sync::{DeliveryLedger, MirrorSync, SyncReport};

use crate::export::{ExportPackager, PackageReport};
use crate::job::{FailureCause, JobState, ProcessingJob};
use crate::notify::DeliveryNotifier;
use crate::runner::{MatcherCommand, RunOutcome};

/// A recipient with reference selfies on disk.
#[derive(Debug, Clone)]
struct Recipient {
    id: RecipientId,
    sources: u32,
}

/// Everything that happened during one job.
#[derive(Debug)]
pub struct JobReport {
    pub job: ProcessingJob,
    /// Sync-down performed before the preconditions were checked.
    pub sync_down: SyncReport,
    pub sync_up: Option<SyncReport>,
    pub packages: Option<PackageReport>,
    pub notified: usize,
    /// Post-processing problems that did not fail the job.
    pub warnings: Vec<String>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.job.state == JobState::Succeeded
    }
}

/// Handle to a started job.
pub struct JobHandle {
    event: EventId,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn event(&self) -> &EventId {
        &self.event
    }

    /// Wait for the run and its post-processing to finish.
    pub async fn wait(self) -> Result<JobReport> {
        self.task
            .await
            .map_err(|e| Error::Process(format!("Job task for event {} failed: {}", self.event, e)))
    }
}

struct Inner {
    sync: MirrorSync,
    ledger: Arc<DeliveryLedger>,
    packager: ExportPackager,
    notifier: Arc<dyn DeliveryNotifier>,
    command: MatcherCommand,
    running: Mutex<HashSet<EventId>>,
    last_jobs: Mutex<HashMap<EventId, ProcessingJob>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reservation of an event's single running slot; released on drop.
pub struct RunningSlot {
    inner: Arc<Inner>,
    event: EventId,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        lock(&self.inner.running).remove(&self.event);
    }
}

/// Starts and supervises matcher jobs, at most one per event.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        sync: MirrorSync,
        ledger: Arc<DeliveryLedger>,
        notifier: Arc<dyn DeliveryNotifier>,
        command: MatcherCommand,
    ) -> Self {
        let packager = ExportPackager::new(sync.clone());
        Self {
            inner: Arc::new(Inner {
                sync,
                ledger,
                packager,
                notifier,
                command,
                running: Mutex::new(HashSet::new()),
                last_jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_running(&self, event: &EventId) -> bool {
        lock(&self.inner.running).contains(event)
    }

    /// Last known job for an event, running or finished.
    pub fn status(&self, event: &EventId) -> Option<ProcessingJob> {
        lock(&self.inner.last_jobs).get(event).cloned()
    }

    /// Start processing an event.
    ///
    /// Remote objects are synced down first, then the preconditions are
    /// checked against the local mirror. On success the matcher runs in the
    /// background and the returned handle yields its report.
    ///
    /// # Errors
    /// - `Precondition` if a job is already running for the event, a remote
    ///   object could not be brought into the mirror, no recipient has
    ///   reference selfies, or the event has no photos. Nothing is spawned
    ///   in that case.
    pub async fn trigger(&self, event: &EventId) -> Result<JobHandle> {
        let slot = self.reserve(event)?;
        let layout = EventLayout::new(event.clone());

        let sync_down = self.inner.sync.sync_down_event(&layout).await.map_err(|e| {
            Error::Precondition(format!(
                "Cannot list remote objects of event {}: {}",
                event, e
            ))
        })?;
        if !sync_down.is_clean() {
            let missing: Vec<String> = sync_down
                .failed
                .iter()
                .map(|(path, _)| path.to_string())
                .collect();
            return Err(Error::Precondition(format!(
                "Local mirror of event {} is incomplete, missing: {}",
                event,
                missing.join(", ")
            )));
        }

        let recipients = self.check_preconditions(&layout).await?;

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let report = run(&inner, &layout, recipients, sync_down).await;
            drop(slot);
            report
        });

        Ok(JobHandle {
            event: event.clone(),
            task,
        })
    }

    /// Take the event's running slot without starting a job.
    ///
    /// Triggers for the event are rejected until the slot is dropped.
    ///
    /// # Errors
    /// - `Precondition` if the slot is already taken
    pub fn reserve(&self, event: &EventId) -> Result<RunningSlot> {
        let mut running = lock(&self.inner.running);
        if !running.insert(event.clone()) {
            return Err(Error::Precondition(format!(
                "A job is already running for event {}",
                event
            )));
        }
        Ok(RunningSlot {
            inner: self.inner.clone(),
            event: event.clone(),
        })
    }

    async fn check_preconditions(&self, layout: &EventLayout) -> Result<Vec<Recipient>> {
        let mirror = self.inner.sync.mirror();
        let event = layout.event();

        let mut recipients = Vec::new();
        for name in mirror.list_dirs(&layout.selfies_root()).await? {
            let Ok(id) = RecipientId::new(name) else {
                continue;
            };
            let sources = count_images(mirror.list_files(&layout.selfies(&id)).await?);
            if sources > 0 {
                recipients.push(Recipient { id, sources });
            }
        }
        if recipients.is_empty() {
            return Err(Error::Precondition(format!(
                "No recipient has reference selfies for event {}",
                event
            )));
        }

        let photos = count_images(mirror.list_files(&layout.photos()).await?);
        if photos == 0 {
            return Err(Error::Precondition(format!(
                "Event {} has no photos to match",
                event
            )));
        }

        info!(event = %event, recipients = recipients.len(), photos, "Preconditions met");
        Ok(recipients)
    }
}

fn count_images(files: Vec<snapmatch_sync::LocalFile>) -> u32 {
    files
        .iter()
        .filter(|f| f.path.name().is_some_and(is_image_name))
        .count() as u32
}

fn record(inner: &Inner, job: &ProcessingJob) {
    lock(&inner.last_jobs).insert(job.event_id.clone(), job.clone());
}

async fn run(
    inner: &Inner,
    layout: &EventLayout,
    recipients: Vec<Recipient>,
    sync_down: SyncReport,
) -> JobReport {
    let event = layout.event().clone();
    let mut report = JobReport {
        job: ProcessingJob::new(event.clone()),
        sync_down,
        sync_up: None,
        packages: None,
        notified: 0,
        warnings: Vec::new(),
    };
    record(inner, &report.job);

    let event_root = inner.sync.mirror().to_fs_path(layout.root());
    let running = match inner.command.spawn(&event, &event_root) {
        Ok(running) => running,
        Err(e) => {
            error!(event = %event, error = %e, "Job failed to start");
            // Idle -> Failed is always valid.
            let _ = report.job.fail(FailureCause::Spawn(e.to_string()));
            record(inner, &report.job);
            return report;
        }
    };

    let limit = running.limit();
    if let Err(e) = report.job.start(running.pid(), limit) {
        report.warnings.push(e.to_string());
    }
    record(inner, &report.job);
    let started_at = report.job.started_at.unwrap_or_else(Utc::now);

    let transition = match running.wait().await {
        Ok(outcome) if outcome.is_success() => report.job.succeed(),
        Ok(RunOutcome::Exited(code)) => report.job.fail(FailureCause::NonZeroExit(code)),
        Ok(RunOutcome::TimedOut) => report.job.fail(FailureCause::Timeout(limit)),
        Err(e) => report.job.fail(FailureCause::Spawn(e.to_string())),
    };
    if let Err(e) = transition {
        report.warnings.push(e.to_string());
    }
    record(inner, &report.job);

    if !report.succeeded() {
        if let Some(cause) = &report.job.failure {
            error!(event = %event, cause = %cause, "Job failed, sources left untouched");
        }
        return report;
    }

    post_process(inner, layout, &recipients, started_at, &mut report).await;
    info!(
        event = %event,
        notified = report.notified,
        warnings = report.warnings.len(),
        "Job complete"
    );
    report
}

/// Sync matched output up, update the ledger, package and notify.
async fn post_process(
    inner: &Inner,
    layout: &EventLayout,
    recipients: &[Recipient],
    started_at: DateTime<Utc>,
    report: &mut JobReport,
) {
    let event = layout.event();
    let mirror = inner.sync.mirror();

    match inner.sync.sync_up_matched(layout).await {
        Ok(sync_up) => report.sync_up = Some(sync_up),
        Err(e) => {
            warn!(event = %event, error = %e, "Sync-up failed");
            report.warnings.push(format!("sync-up: {}", e));
        }
    }

    for recipient in recipients {
        let matched = match mirror.list_files(&layout.matched(&recipient.id)).await {
            Ok(files) => count_images(files),
            Err(e) => {
                report.warnings.push(format!("{}: {}", recipient.id, e));
                0
            }
        };
        if let Err(e) = inner
            .ledger
            .mark_processed(event, &recipient.id, recipient.sources, matched, started_at)
            .await
        {
            warn!(recipient = %recipient.id, error = %e, "Failed to record processing");
            report.warnings.push(format!("{}: {}", recipient.id, e));
        }
    }

    let packages = match inner.packager.package_event(layout).await {
        Ok(packages) => packages,
        Err(e) => {
            warn!(event = %event, error = %e, "Packaging failed");
            report.warnings.push(format!("packaging: {}", e));
            return;
        }
    };

    for export in &packages.packaged {
        let delivered = async {
            inner.ledger.mark_packaged(event, &export.recipient).await?;
            inner.notifier.notify(event, export).await?;
            inner.ledger.mark_notified(event, &export.recipient).await
        }
        .await;
        match delivered {
            Ok(()) => report.notified += 1,
            Err(e) => {
                warn!(recipient = %export.recipient, error = %e, "Delivery step failed");
                report.warnings.push(format!("{}: {}", export.recipient, e));
            }
        }
    }
    report.packages = Some(packages);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::export::MANIFEST_NAME;
    use crate::notify::LogNotifier;
    use snapmatch_common::StoragePath;
    use snapmatch_storage::{MemoryProvider, Operation, StorageMode, StorageProvider};
    use snapmatch_sync::LocalMirror;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn path(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    fn e1() -> EventId {
        EventId::new("e1").unwrap()
    }

    fn bob() -> RecipientId {
        RecipientId::new("bob").unwrap()
    }

    struct Fixture {
        temp: TempDir,
        provider: Arc<MemoryProvider>,
        ledger: Arc<DeliveryLedger>,
        orchestrator: JobOrchestrator,
    }

    fn fixture(script: &str, timeout: Duration) -> Fixture {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let ledger = Arc::new(DeliveryLedger::in_memory());
        let sync = MirrorSync::new(
            Arc::new(LocalMirror::new(temp.path().join("mirror"))),
            StorageMode::Remote(provider.clone()),
        );
        let command = MatcherCommand::new("sh")
            .args(["-c", script, "matcher"])
            .with_timeout(timeout);
        let orchestrator = JobOrchestrator::new(sync, ledger.clone(), Arc::new(LogNotifier), command);
        Fixture {
            temp,
            provider,
            ledger,
            orchestrator,
        }
    }

    async fn seed_remote(provider: &MemoryProvider, paths: &[&str]) {
        for p in paths {
            provider.upload(&path(p), b"img".to_vec(), None).await.unwrap();
        }
    }

    /// Copies the first two photos into bob's matched folder.
    const MATCH_TWO: &str = r#"mkdir -p "$1/matched/bob" && cp "$1/photos/a.jpg" "$1/photos/b.jpg" "$1/matched/bob/""#;

    #[tokio::test]
    async fn test_successful_job_packages_matches() {
        let f = fixture(MATCH_TWO, Duration::from_secs(30));
        seed_remote(
            &f.provider,
            &[
                "events/e1/photos/a.jpg",
                "events/e1/photos/b.jpg",
                "events/e1/photos/c.jpg",
                "events/e1/selfies/bob/s.jpg",
            ],
        )
        .await;
        f.ledger.record_source(&e1(), &bob(), 1, Utc::now()).await.unwrap();

        let report = f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();

        assert!(report.succeeded(), "{:?}", report);
        assert_eq!(report.sync_down.synced, 4);
        assert_eq!(report.sync_up.as_ref().unwrap().synced, 2);
        assert!(f.provider.exists(&path("events/e1/matched/bob/a.jpg")).await.unwrap());

        let packages = report.packages.as_ref().unwrap();
        assert_eq!(packages.packaged.len(), 1);
        assert_eq!(packages.packaged[0].file_count, 2);

        let data = f.provider.download(&path("events/e1/exports/bob.zip")).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
        let images = archive.file_names().filter(|n| n.ends_with(".jpg")).count();
        assert_eq!(images, 2);
        assert!(archive.by_name(MANIFEST_NAME).is_ok());

        let record = f.ledger.get(&e1(), &bob()).await.unwrap();
        assert_eq!(record.matched_count, 2);
        assert!(record.packaged && record.notified);
        assert!(!record.is_pending());
        assert_eq!(report.notified, 1);

        let status = f.orchestrator.status(&e1()).unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert!(!f.orchestrator.is_running(&e1()));
    }

    #[tokio::test]
    async fn test_no_archive_for_recipient_without_matches() {
        let f = fixture(MATCH_TWO, Duration::from_secs(30));
        seed_remote(
            &f.provider,
            &[
                "events/e1/photos/a.jpg",
                "events/e1/photos/b.jpg",
                "events/e1/selfies/bob/s.jpg",
                "events/e1/selfies/carol/s.jpg",
            ],
        )
        .await;

        let report = f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();

        assert!(report.succeeded());
        assert!(!f.provider.exists(&path("events/e1/exports/carol.zip")).await.unwrap());
        let carol = f.ledger.get(&e1(), &RecipientId::new("carol").unwrap()).await.unwrap();
        assert_eq!(carol.matched_count, 0);
        assert!(!carol.packaged);
    }

    #[tokio::test]
    async fn test_no_selfies_is_rejected_without_spawning() {
        let f = fixture(r#"touch "$1/spawned""#, Duration::from_secs(30));
        seed_remote(&f.provider, &["events/e1/photos/a.jpg"]).await;

        let result = f.orchestrator.trigger(&e1()).await;

        match result {
            Err(Error::Precondition(msg)) => assert!(msg.contains("selfies")),
            other => panic!("expected precondition error, got {:?}", other.map(|h| h.event().clone())),
        }
        assert!(!f.temp.path().join("mirror/events/e1/spawned").exists());
        assert!(f.orchestrator.status(&e1()).is_none());
        assert!(!f.orchestrator.is_running(&e1()));
    }

    #[tokio::test]
    async fn test_incomplete_mirror_is_rejected() {
        let f = fixture(r#"touch "$1/spawned""#, Duration::from_secs(30));
        seed_remote(
            &f.provider,
            &[
                "events/e1/photos/a.jpg",
                "events/e1/photos/b.jpg",
                "events/e1/selfies/bob/s.jpg",
            ],
        )
        .await;
        f.ledger.record_source(&e1(), &bob(), 1, Utc::now()).await.unwrap();
        f.provider.fail_on(Operation::Download, &path("events/e1/photos/b.jpg"));

        match f.orchestrator.trigger(&e1()).await {
            Err(Error::Precondition(msg)) => assert!(msg.contains("events/e1/photos/b.jpg"), "{}", msg),
            other => panic!("expected precondition error, got {:?}", other.map(|h| h.event().clone())),
        }
        assert!(!f.temp.path().join("mirror/events/e1/spawned").exists());
        assert!(f.orchestrator.status(&e1()).is_none());
        assert!(f.ledger.is_pending(&e1(), &bob()).await);
        assert!(!f.orchestrator.is_running(&e1()));

        // Once the object comes through the job runs.
        f.provider.clear_failures();
        let report = f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();
        assert!(report.succeeded());
        assert!(f.temp.path().join("mirror/events/e1/photos/b.jpg").exists());
    }

    #[tokio::test]
    async fn test_remote_listing_failure_is_rejected() {
        let f = fixture("exit 0", Duration::from_secs(30));
        seed_remote(&f.provider, &["events/e1/photos/a.jpg", "events/e1/selfies/bob/s.jpg"]).await;
        f.provider.fail_on(Operation::List, &path("events/e1"));

        let result = f.orchestrator.trigger(&e1()).await;

        assert!(matches!(result, Err(Error::Precondition(msg)) if msg.contains("remote objects")));
        assert!(!f.orchestrator.is_running(&e1()));
    }

    #[tokio::test]
    async fn test_reserved_event_cannot_be_triggered() {
        let f = fixture("exit 0", Duration::from_secs(30));
        seed_remote(&f.provider, &["events/e1/photos/a.jpg", "events/e1/selfies/bob/s.jpg"]).await;

        let slot = f.orchestrator.reserve(&e1()).unwrap();
        assert!(f.orchestrator.is_running(&e1()));
        assert!(matches!(f.orchestrator.trigger(&e1()).await, Err(Error::Precondition(_))));

        drop(slot);
        assert!(f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_no_photos_is_rejected() {
        let f = fixture("exit 0", Duration::from_secs(30));
        seed_remote(&f.provider, &["events/e1/selfies/bob/s.jpg", "events/e1/photos/notes.txt"]).await;

        let result = f.orchestrator.trigger(&e1()).await;
        assert!(matches!(result, Err(Error::Precondition(msg)) if msg.contains("photos")));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_preserves_sources() {
        let f = fixture("exec sleep 30", Duration::from_millis(200));
        seed_remote(&f.provider, &["events/e1/photos/a.jpg", "events/e1/selfies/bob/s.jpg"]).await;

        let report = f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();

        assert_eq!(report.job.state, JobState::Failed);
        assert!(matches!(report.job.failure, Some(FailureCause::Timeout(_))));
        assert!(report.packages.is_none());
        assert!(f.provider.exists(&path("events/e1/photos/a.jpg")).await.unwrap());
        assert!(f.temp.path().join("mirror/events/e1/photos/a.jpg").exists());
        assert!(f.ledger.get(&e1(), &bob()).await.is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let f = fixture("exit 4", Duration::from_secs(30));
        seed_remote(&f.provider, &["events/e1/photos/a.jpg", "events/e1/selfies/bob/s.jpg"]).await;

        let report = f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();

        assert_eq!(report.job.exit_code, Some(4));
        assert_eq!(report.job.failure, Some(FailureCause::NonZeroExit(Some(4))));
        assert!(report.sync_up.is_none());
    }

    #[tokio::test]
    async fn test_single_flight_per_event() {
        let f = fixture("sleep 1", Duration::from_secs(30));
        seed_remote(
            &f.provider,
            &[
                "events/e1/photos/a.jpg",
                "events/e1/selfies/bob/s.jpg",
                "events/e2/photos/a.jpg",
                "events/e2/selfies/bob/s.jpg",
            ],
        )
        .await;
        let e2 = EventId::new("e2").unwrap();

        let first = f.orchestrator.trigger(&e1()).await.unwrap();
        assert!(f.orchestrator.is_running(&e1()));
        assert!(matches!(
            f.orchestrator.trigger(&e1()).await,
            Err(Error::Precondition(_))
        ));
        let other = f.orchestrator.trigger(&e2).await.unwrap();

        assert!(first.wait().await.unwrap().succeeded());
        assert!(other.wait().await.unwrap().succeeded());

        // The slot is free again once the job is done.
        assert!(!f.orchestrator.is_running(&e1()));
        f.orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_only_mode() {
        let temp = TempDir::new().unwrap();
        let mirror = Arc::new(LocalMirror::new(temp.path()));
        mirror.write(&path("events/e1/photos/a.jpg"), b"a").await.unwrap();
        mirror.write(&path("events/e1/photos/b.jpg"), b"b").await.unwrap();
        mirror.write(&path("events/e1/selfies/bob/s.jpg"), b"s").await.unwrap();

        let orchestrator = JobOrchestrator::new(
            MirrorSync::new(mirror.clone(), StorageMode::LocalOnly),
            Arc::new(DeliveryLedger::in_memory()),
            Arc::new(LogNotifier),
            MatcherCommand::new("sh").args(["-c", MATCH_TWO, "matcher"]),
        );

        let report = orchestrator.trigger(&e1()).await.unwrap().wait().await.unwrap();

        assert!(report.succeeded());
        assert!(!report.packages.unwrap().packaged[0].uploaded);
        assert!(mirror.exists(&path("events/e1/exports/bob.zip")).await);
    }
}
