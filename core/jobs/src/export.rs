//! Per-recipient delivery archives.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use snapmatch_common::{Error, EventLayout, RecipientId, Result, StoragePath};
use snapmatch_sync::MirrorSync;

pub const ARCHIVE_EXTENSION: &str = "zip";
pub const MANIFEST_NAME: &str = "manifest.json";
pub const NOTE_NAME: &str = "README.txt";
/// Folder inside the archive holding the matched files.
pub const PHOTOS_FOLDER: &str = "photos";

const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Machine-readable listing stored inside every archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub event_id: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size_bytes: u64,
}

/// An archive written for one recipient.
#[derive(Debug, Clone)]
pub struct PackagedExport {
    pub recipient: RecipientId,
    pub path: StoragePath,
    pub file_count: usize,
    pub size_bytes: u64,
    /// Whether the archive was pushed to remote storage.
    pub uploaded: bool,
}

#[derive(Debug, Default)]
pub struct PackageReport {
    pub packaged: Vec<PackagedExport>,
    /// Recipients with no matched files.
    pub skipped: Vec<RecipientId>,
    pub failed: Vec<(RecipientId, String)>,
}

/// Builds archives from the local `matched/{recipient}/` trees.
#[derive(Clone)]
pub struct ExportPackager {
    sync: MirrorSync,
}

impl ExportPackager {
    pub fn new(sync: MirrorSync) -> Self {
        Self { sync }
    }

    /// Package every recipient that has a matched folder.
    pub async fn package_event(&self, layout: &EventLayout) -> Result<PackageReport> {
        let recipients: Vec<RecipientId> = self
            .sync
            .mirror()
            .list_dirs(&layout.matched_root())
            .await?
            .into_iter()
            .filter_map(|name| RecipientId::new(name).ok())
            .collect();

        let results = join_all(
            recipients
                .iter()
                .map(|recipient| self.package_recipient(layout, recipient)),
        )
        .await;

        let mut report = PackageReport::default();
        for (recipient, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(Some(export)) => report.packaged.push(export),
                Ok(None) => report.skipped.push(recipient),
                Err(e) => {
                    warn!(event = %layout.event(), recipient = %recipient, error = %e, "Packaging failed");
                    report.failed.push((recipient, e.to_string()));
                }
            }
        }

        info!(
            event = %layout.event(),
            packaged = report.packaged.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Packaging complete"
        );
        Ok(report)
    }

    /// Rebuild one recipient's archive from scratch.
    ///
    /// Any previous archive is removed first, locally and remotely. Returns
    /// `None` when the recipient has no matched files.
    pub async fn package_recipient(
        &self,
        layout: &EventLayout,
        recipient: &RecipientId,
    ) -> Result<Option<PackagedExport>> {
        let mirror = self.sync.mirror();
        let archive_path = layout.export_archive(recipient, ARCHIVE_EXTENSION)?;

        mirror.remove(&archive_path).await?;
        if let Some(remote) = self.sync.remote() {
            if let Err(e) = remote.delete(&archive_path).await {
                warn!(path = %archive_path, error = %e, "Failed to delete previous remote archive");
            }
        }

        let matched_dir = layout.matched(recipient);
        let sources: Vec<(String, PathBuf, u64)> = mirror
            .list_files(&matched_dir)
            .await?
            .into_iter()
            .filter_map(|file| {
                let name = format!(
                    "{}/{}",
                    PHOTOS_FOLDER,
                    file.path.strip_prefix(&matched_dir)?.as_key()
                );
                Some((name, mirror.to_fs_path(&file.path), file.size_bytes))
            })
            .collect();

        if sources.is_empty() {
            debug!(recipient = %recipient, "No matched files, skipping");
            return Ok(None);
        }

        let manifest = ExportManifest {
            event_id: layout.event().to_string(),
            recipient_id: recipient.to_string(),
            created_at: Utc::now(),
            files: sources
                .iter()
                .map(|(name, _, size)| ManifestEntry {
                    name: name.clone(),
                    size_bytes: *size,
                })
                .collect(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let note = delivery_note(&manifest);
        let file_count = sources.len();

        // Removed on drop, whichever way this function returns.
        let scratch = TempDir::new()?;
        let scratch_path = scratch.path().join(format!("{}.{}", recipient, ARCHIVE_EXTENSION));

        let data = tokio::task::spawn_blocking(move || {
            write_archive(&scratch_path, &sources, &manifest_json, &note)?;
            let mut data = Vec::new();
            File::open(&scratch_path)?.read_to_end(&mut data)?;
            Ok::<_, Error>(data)
        })
        .await
        .map_err(|e| Error::Storage(format!("Archive task failed: {}", e)))??;
        drop(scratch);

        let size_bytes = data.len() as u64;
        mirror.write(&archive_path, &data).await?;

        let mut uploaded = false;
        if let Some(remote) = self.sync.remote() {
            match remote
                .upload(&archive_path, data, Some(ARCHIVE_CONTENT_TYPE))
                .await
            {
                Ok(_) => uploaded = true,
                Err(e) => warn!(path = %archive_path, error = %e, "Failed to upload archive"),
            }
        }

        info!(
            event = %layout.event(),
            recipient = %recipient,
            files = file_count,
            size_bytes,
            uploaded,
            "Archive built"
        );
        Ok(Some(PackagedExport {
            recipient: recipient.clone(),
            path: archive_path,
            file_count,
            size_bytes,
            uploaded,
        }))
    }
}

fn write_archive(
    target: &Path,
    sources: &[(String, PathBuf, u64)],
    manifest: &[u8],
    note: &str,
) -> Result<()> {
    // Photos are already compressed.
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(File::create(target)?);

    for (name, fs_path, _) in sources {
        zip.start_file(name.as_str(), options).map_err(archive_error)?;
        let mut source = File::open(fs_path)?;
        std::io::copy(&mut source, &mut zip)?;
    }

    zip.start_file(MANIFEST_NAME, options).map_err(archive_error)?;
    zip.write_all(manifest)?;
    zip.start_file(NOTE_NAME, options).map_err(archive_error)?;
    zip.write_all(note.as_bytes())?;

    zip.finish().map_err(archive_error)?;
    Ok(())
}

fn archive_error(e: zip::result::ZipError) -> Error {
    Error::Storage(format!("Failed to write archive: {}", e))
}

fn delivery_note(manifest: &ExportManifest) -> String {
    let mut note = format!(
        "Your photos from event {}\n\n{} photo(s) were matched to you.\n\n",
        manifest.event_id,
        manifest.files.len()
    );
    for entry in &manifest.files {
        note.push_str(&format!("  {}\n", entry.name));
    }
    note.push_str(&format!(
        "\nPrepared {}.\n",
        manifest.created_at.format("%Y-%m-%d %H:%M UTC")
    ));
    note
}
