//! Common utilities and types shared across SnapMatch modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the shared error vocabulary, the virtual path type used as the key for both
//! remote objects and local mirror files, and the event/recipient identifiers
//! that make up the path convention.

pub mod error;
pub mod layout;
pub mod types;

pub use error::{Error, Result};
pub use layout::{is_image_name, Category, EventLayout};
pub use types::{EventId, RecipientId, StoragePath};
