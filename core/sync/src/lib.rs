//! SnapMatch local mirror and intake
//!
//! This crate keeps the filesystem working copy used by the matcher in step
//! with remote storage:
//! - `LocalMirror` for atomic writes and listings under the mirror root
//! - `MirrorSync` for sync-down of uploads and sync-up of matched output
//! - `UploadIntake` for sanitizing and storing incoming files
//! - `DeliveryLedger` for per-recipient processing and delivery state

pub mod intake;
pub mod ledger;
pub mod mirror;
pub mod sanitize;
pub mod sync;

// Re-export main types
pub use intake::{BatchReport, FileOutcome, FileReport, IncomingFile, IntakeTarget, UploadIntake};
pub use ledger::{DeliveryLedger, RecipientDeliveryRecord};
pub use mirror::{LocalFile, LocalMirror};
pub use sanitize::{sanitize_file_name, NameSequence, PLACEHOLDER_NAME};
pub use sync::{MirrorSync, SyncReport};
