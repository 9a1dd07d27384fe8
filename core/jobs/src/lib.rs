//! SnapMatch job orchestration
//!
//! Drives the external matcher for one event at a time and turns its output
//! into per-recipient delivery archives.

pub mod export;
pub mod job;
pub mod notify;
pub mod orchestrator;
pub mod runner;

pub use export::{
    ExportManifest, ExportPackager, ManifestEntry, PackageReport, PackagedExport,
    ARCHIVE_EXTENSION, MANIFEST_NAME, NOTE_NAME, PHOTOS_FOLDER,
};
pub use job::{FailureCause, JobState, ProcessingJob};
pub use notify::{DeliveryNotifier, LogNotifier};
pub use orchestrator::{JobHandle, JobOrchestrator, JobReport, RunningSlot};
pub use runner::{MatcherCommand, RunOutcome, RunningMatcher, DEFAULT_TIMEOUT, MAX_TIMEOUT};
