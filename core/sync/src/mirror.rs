//! Filesystem-backed working copy of the remote store.

use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use snapmatch_common::{Error, Result, StoragePath};

/// Suffix of in-flight writes; such files are never listed.
const PARTIAL_SUFFIX: &str = ".partial";

/// A file in the local mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub path: StoragePath,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Local mirror rooted at a directory.
///
/// Files are addressed with the same virtual paths as remote objects, so
/// `events/e1/photos/a.jpg` lives at `{root}/events/e1/photos/a.jpg`.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a virtual path to a filesystem path.
    pub fn to_fs_path(&self, path: &StoragePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    /// Create a directory and its parents. Succeeds if it already exists.
    pub async fn ensure_dir(&self, path: &StoragePath) -> Result<()> {
        fs::create_dir_all(self.to_fs_path(path)).await?;
        Ok(())
    }

    /// Write a file, creating parent directories.
    ///
    /// Bytes go to a sibling temp file that is renamed into place, so readers
    /// never observe a half-written file.
    pub async fn write(&self, path: &StoragePath, data: &[u8]) -> Result<()> {
        let name = path
            .name()
            .ok_or_else(|| Error::InvalidInput("Cannot write to mirror root".to_string()))?;
        let target = self.to_fs_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = target.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4().simple(), PARTIAL_SUFFIX));
        fs::write(&temp, data).await?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn read(&self, path: &StoragePath) -> Result<Vec<u8>> {
        match fs::read(self.to_fs_path(path)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Not in local mirror: {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, path: &StoragePath) -> bool {
        fs::try_exists(self.to_fs_path(path)).await.unwrap_or(false)
    }

    /// Stat a regular file. `None` if it does not exist.
    pub async fn stat(&self, path: &StoragePath) -> Result<Option<LocalFile>> {
        match fs::metadata(self.to_fs_path(path)).await {
            Ok(meta) if meta.is_file() => Ok(Some(LocalFile {
                path: path.clone(),
                size_bytes: meta.len(),
                modified: meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now()),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a file. Returns `false` if it was absent.
    pub async fn remove(&self, path: &StoragePath) -> Result<bool> {
        match fs::remove_file(self.to_fs_path(path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a directory tree. Returns `false` if it was absent.
    pub async fn remove_dir(&self, path: &StoragePath) -> Result<bool> {
        if path.is_root() {
            return Err(Error::InvalidInput("Refusing to remove mirror root".to_string()));
        }
        match fs::remove_dir_all(self.to_fs_path(path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every regular file under `prefix`, recursively, sorted by path.
    ///
    /// A missing prefix yields an empty list.
    pub async fn list_files(&self, prefix: &StoragePath) -> Result<Vec<LocalFile>> {
        let mut files = Vec::new();
        let mut pending = vec![prefix.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(self.to_fs_path(&dir)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) if e.kind() == ErrorKind::NotADirectory => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let child = dir.join(&name)?;
                let meta = entry.metadata().await?;

                if meta.is_dir() {
                    pending.push(child);
                } else if meta.is_file() {
                    files.push(LocalFile {
                        path: child,
                        size_bytes: meta.len(),
                        modified: meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now()),
                    });
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Names of the direct subdirectories of `path`, sorted.
    pub async fn list_dirs(&self, path: &StoragePath) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.to_fs_path(path)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    dirs.push(name);
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        let target = path("events/e1/selfies/bob/1_me.jpg");

        mirror.write(&target, b"selfie").await.unwrap();

        assert!(temp.path().join("events/e1/selfies/bob/1_me.jpg").is_file());
        assert_eq!(mirror.read(&target).await.unwrap(), b"selfie");
    }

    #[tokio::test]
    async fn test_write_overwrites_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        let target = path("a/b.jpg");

        mirror.write(&target, b"one").await.unwrap();
        mirror.write(&target, b"two").await.unwrap();

        assert_eq!(mirror.read(&target).await.unwrap(), b"two");
        let names: Vec<_> = std::fs::read_dir(temp.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        let dir = path("events/e1/matched/bob");

        mirror.ensure_dir(&dir).await.unwrap();
        mirror.ensure_dir(&dir).await.unwrap();

        assert!(temp.path().join("events/e1/matched/bob").is_dir());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        assert!(mirror.read(&path("nope.jpg")).await.unwrap_err().is_not_found());
        assert!(mirror.stat(&path("nope.jpg")).await.unwrap().is_none());
        assert!(!mirror.remove(&path("nope.jpg")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_files_recursive_and_sorted() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        mirror.write(&path("events/e1/photos/b.jpg"), b"b").await.unwrap();
        mirror.write(&path("events/e1/photos/a.jpg"), b"aa").await.unwrap();
        mirror.write(&path("events/e1/selfies/bob/s.jpg"), b"s").await.unwrap();
        mirror.write(&path("events/e2/photos/x.jpg"), b"x").await.unwrap();

        let files = mirror.list_files(&path("events/e1")).await.unwrap();
        let keys: Vec<_> = files.iter().map(|f| f.path.as_key()).collect();

        assert_eq!(
            keys,
            vec![
                "events/e1/photos/a.jpg",
                "events/e1/photos/b.jpg",
                "events/e1/selfies/bob/s.jpg"
            ]
        );
        assert_eq!(files[0].size_bytes, 2);
        assert!(mirror.list_files(&path("events/none")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_dirs() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        mirror.ensure_dir(&path("events/e1/selfies/carol")).await.unwrap();
        mirror.write(&path("events/e1/selfies/bob/s.jpg"), b"s").await.unwrap();
        mirror.write(&path("events/e1/selfies/stray.jpg"), b"s").await.unwrap();

        assert_eq!(
            mirror.list_dirs(&path("events/e1/selfies")).await.unwrap(),
            vec!["bob", "carol"]
        );
        assert!(mirror.list_dirs(&path("events/e9")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_dir() {
        let temp = TempDir::new().unwrap();
        let mirror = LocalMirror::new(temp.path());
        mirror.write(&path("events/e1/photos/a.jpg"), b"a").await.unwrap();

        assert!(mirror.remove_dir(&path("events/e1")).await.unwrap());
        assert!(!mirror.remove_dir(&path("events/e1")).await.unwrap());
        assert!(mirror.remove_dir(&StoragePath::root()).await.is_err());
    }
}
