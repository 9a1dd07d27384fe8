//! Virtual path layout shared by remote storage and the local mirror.
//!
//! ```text
//! events/{event}/photos/*
//! events/{event}/selfies/{recipient}/*
//! events/{event}/matched/{recipient}/*
//! events/{event}/exports/{recipient}.{ext}
//! events/{event}/qr-code.png
//! ```

use crate::types::{EventId, RecipientId, StoragePath};
use crate::Result;

pub const EVENTS_DIR: &str = "events";
pub const PHOTOS_DIR: &str = "photos";
pub const SELFIES_DIR: &str = "selfies";
pub const MATCHED_DIR: &str = "matched";
pub const EXPORTS_DIR: &str = "exports";
pub const QR_CODE_FILE: &str = "qr-code.png";

/// Extensions the matcher reads. Anything else is not source material.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Whether a file name carries one of the image extensions the matcher reads.
pub fn is_image_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => IMAGE_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known)),
        _ => false,
    }
}

/// Top-level category of a path inside an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Photos,
    Selfies(RecipientId),
    Matched(RecipientId),
    Exports,
}

/// Path builder for a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLayout {
    event: EventId,
    root: StoragePath,
}

impl EventLayout {
    pub fn new(event: EventId) -> Self {
        let root = StoragePath::from_components(vec![
            EVENTS_DIR.to_string(),
            event.as_str().to_string(),
        ])
        .unwrap_or_else(|_| StoragePath::root());
        Self { event, root }
    }

    pub fn event(&self) -> &EventId {
        &self.event
    }

    /// `events/{event}`
    pub fn root(&self) -> &StoragePath {
        &self.root
    }

    pub fn photos(&self) -> StoragePath {
        self.child(&[PHOTOS_DIR])
    }

    pub fn photo(&self, file_name: &str) -> Result<StoragePath> {
        self.photos().join(file_name)
    }

    pub fn selfies_root(&self) -> StoragePath {
        self.child(&[SELFIES_DIR])
    }

    pub fn selfies(&self, recipient: &RecipientId) -> StoragePath {
        self.child(&[SELFIES_DIR, recipient.as_str()])
    }

    pub fn selfie(&self, recipient: &RecipientId, file_name: &str) -> Result<StoragePath> {
        self.selfies(recipient).join(file_name)
    }

    pub fn matched_root(&self) -> StoragePath {
        self.child(&[MATCHED_DIR])
    }

    pub fn matched(&self, recipient: &RecipientId) -> StoragePath {
        self.child(&[MATCHED_DIR, recipient.as_str()])
    }

    pub fn exports(&self) -> StoragePath {
        self.child(&[EXPORTS_DIR])
    }

    /// `events/{event}/exports/{recipient}.{ext}`
    pub fn export_archive(&self, recipient: &RecipientId, ext: &str) -> Result<StoragePath> {
        self.exports()
            .join(&format!("{}.{}", recipient.as_str(), ext))
    }

    pub fn qr_code(&self) -> StoragePath {
        self.child(&[QR_CODE_FILE])
    }

    /// Classify a path belonging to this event.
    pub fn classify(&self, path: &StoragePath) -> Option<Category> {
        let relative = path.strip_prefix(&self.root)?;
        match relative.components() {
            [dir, ..] if dir == PHOTOS_DIR => Some(Category::Photos),
            [dir, ..] if dir == EXPORTS_DIR => Some(Category::Exports),
            [dir, recipient, ..] if dir == SELFIES_DIR => {
                RecipientId::new(recipient.clone()).ok().map(Category::Selfies)
            }
            [dir, recipient, ..] if dir == MATCHED_DIR => {
                RecipientId::new(recipient.clone()).ok().map(Category::Matched)
            }
            _ => None,
        }
    }

    fn child(&self, parts: &[&str]) -> StoragePath {
        let mut components = self.root.components().to_vec();
        components.extend(parts.iter().map(|p| p.to_string()));
        // Every part is a validated id or a constant, so this cannot fail.
        StoragePath::from_components(components).unwrap_or_else(|_| self.root.clone())
    }
}
