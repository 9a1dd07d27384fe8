//! Storage provider abstraction for SnapMatch.
//!
//! This module provides a trait-based interface over the remote object stores
//! an event can be backed by (Google Drive, Google Cloud Storage, S3-compatible
//! stores) and a provider registry that resolves the configured backend once
//! at startup.
//!
//! # Design Principles
//! - Provider isolation: callers hold an `Arc<dyn StorageProvider>` and never
//!   branch on provider names
//! - Async operations: all I/O operations are async
//! - Unified error semantics: every provider maps failures onto the shared
//!   `snapmatch_common::Error` vocabulary
//! - Rate limiting is a decorator, not a provider concern

pub mod gcs;
pub mod gdrive;
pub mod google;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod s3;
pub mod throttle;

pub use memory::{MemoryProvider, Operation};
pub use provider::{
    guess_content_type, BulkDeleteReport, ObjectMetadata, StorageObject, StorageProvider,
    UploadReceipt,
};
pub use registry::{
    create_default_registry, ProviderFactory, ProviderRegistry, StorageConfig, StorageMode, LOCAL_ONLY,
};
pub use retry::{RetryConfig, RetryExecutor};
pub use throttle::ThrottledProvider;
