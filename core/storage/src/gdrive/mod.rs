//! Google Drive storage provider.
//!
//! The account-based personal cloud backend:
//! - OAuth2 authentication with automatic token refresh
//! - Folder-per-path-segment layout under a configured root folder
//! - Path-to-ID caching
//! - Upload pacing and rate-limit backoff via [`ThrottledProvider`](crate::throttle::ThrottledProvider)

pub mod client;
pub mod provider;

pub use client::{DriveClient, DriveFile};
pub use provider::{create_gdrive_provider, GDriveConfig, GDriveProvider};
