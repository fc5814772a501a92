//! Backup snapshots
//!
//! The orchestrator only reads snapshots; producing them is someone else's
//! job. A store answers whether a category has a snapshot and restores the
//! newest one over a destination, replacing whatever was there.

use crate::error::BackupError;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read-only access to backup snapshots, grouped by category
#[async_trait::async_trait]
pub trait BackupStore: Send + Sync {
    async fn has_snapshot(&self, category: &str) -> Result<bool, BackupError>;

    /// Name of the newest snapshot, if any
    async fn latest_snapshot(&self, category: &str) -> Result<Option<String>, BackupError>;

    /// Replace `destination` with the newest snapshot of `category`,
    /// returning the snapshot's name
    async fn restore_latest(&self, category: &str, destination: &Path)
        -> Result<String, BackupError>;
}

/// Snapshots as directories under `<root>/<category>/<name>/`
///
/// Names sort chronologically (e.g. `20240101T120000Z`), so the newest
/// snapshot is the greatest name.
#[derive(Debug, Clone)]
pub struct DirectoryBackupStore {
    root: PathBuf,
}

impl DirectoryBackupStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn latest_blocking(root: &Path, category: &str) -> Result<Option<String>, BackupError> {
        let dir = root.join(category);
        if !dir.is_dir() {
            return Ok(None);
        }
        let entries = fs::read_dir(&dir).map_err(|source| BackupError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut latest: Option<String> = None;
        for entry in entries {
            let entry = entry.map_err(|source| BackupError::Io {
                path: dir.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if latest.as_ref().map_or(true, |current| name > *current) {
                latest = Some(name);
            }
        }
        Ok(latest)
    }
}

#[async_trait::async_trait]
impl BackupStore for DirectoryBackupStore {
    async fn has_snapshot(&self, category: &str) -> Result<bool, BackupError> {
        Ok(self.latest_snapshot(category).await?.is_some())
    }

    async fn latest_snapshot(&self, category: &str) -> Result<Option<String>, BackupError> {
        let root = self.root.clone();
        let category = category.to_string();
        tokio::task::spawn_blocking(move || Self::latest_blocking(&root, &category))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
    }

    async fn restore_latest(
        &self,
        category: &str,
        destination: &Path,
    ) -> Result<String, BackupError> {
        let root = self.root.clone();
        let category = category.to_string();
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let name = Self::latest_blocking(&root, &category)?
                .ok_or_else(|| BackupError::NotFound(category.clone()))?;
            let snapshot = root.join(&category).join(&name);
            replace_tree(&snapshot, &destination)?;
            tracing::info!(
                category = %category,
                snapshot = %name,
                destination = %destination.display(),
                "restored snapshot"
            );
            Ok(name)
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))?
    }
}

/// Copy the tree at `from` into `to`, creating directories as needed
///
/// Symlinks are recreated as links, not followed. Returns the number of
/// files and links copied.
///
/// # Errors
/// `BackupError::Walk` or `BackupError::Io`.
pub fn copy_tree(from: &Path, to: &Path) -> Result<u64, BackupError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| BackupError::Io { path, source }
    };

    if from.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::copy(from, to).map_err(io_err(to))?;
        return Ok(1);
    }

    let mut copied = 0;
    fs::create_dir_all(to).map_err(io_err(to))?;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|source| BackupError::Walk {
            path: from.to_path_buf(),
            source,
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| BackupError::Io {
                path: entry.path().to_path_buf(),
                source: std::io::Error::other(e),
            })?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(io_err(&target))?;
            copied += 1;
        } else if entry.file_type().is_symlink() {
            copy_link(entry.path(), &target)?;
            copied += 1;
        } else {
            tracing::warn!(path = %entry.path().display(), "skipping special file");
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_link(link: &Path, to: &Path) -> Result<(), BackupError> {
    let pointee = fs::read_link(link).map_err(|source| BackupError::Io {
        path: link.to_path_buf(),
        source,
    })?;
    std::os::unix::fs::symlink(&pointee, to).map_err(|source| BackupError::Io {
        path: to.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn copy_link(link: &Path, to: &Path) -> Result<(), BackupError> {
    // follow it instead; link creation needs privileges here
    fs::copy(link, to).map(drop).map_err(|source| BackupError::Io {
        path: to.to_path_buf(),
        source,
    })
}

/// Remove `to` entirely, then copy `from` in its place
///
/// # Errors
/// See [`copy_tree`].
pub fn replace_tree(from: &Path, to: &Path) -> Result<u64, BackupError> {
    if to.is_dir() {
        fs::remove_dir_all(to).map_err(|source| BackupError::Io {
            path: to.to_path_buf(),
            source,
        })?;
    } else if to.exists() {
        fs::remove_file(to).map_err(|source| BackupError::Io {
            path: to.to_path_buf(),
            source,
        })?;
    }
    copy_tree(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn latest_snapshot_is_greatest_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryBackupStore::new(dir.path());
        assert!(!store.has_snapshot("config").await.unwrap());

        fs::create_dir_all(dir.path().join("config/20240101T000000Z")).unwrap();
        fs::create_dir_all(dir.path().join("config/20240301T000000Z")).unwrap();
        fs::create_dir_all(dir.path().join("config/.partial")).unwrap();
        write(&dir.path().join("config/zzz-not-a-dir"), "x");

        assert!(store.has_snapshot("config").await.unwrap());
        assert_eq!(
            store.latest_snapshot("config").await.unwrap().as_deref(),
            Some("20240301T000000Z")
        );
    }

    #[tokio::test]
    async fn restore_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("backups");
        write(&root.join("data/20240101T000000Z/db/state.json"), "{\"v\":1}");

        let destination = dir.path().join("live");
        write(&destination.join("stale.txt"), "old");
        write(&destination.join("db/state.json"), "{\"v\":2}");

        let store = DirectoryBackupStore::new(&root);
        let name = store.restore_latest("data", &destination).await.unwrap();
        assert_eq!(name, "20240101T000000Z");
        assert!(!destination.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(destination.join("db/state.json")).unwrap(), "{\"v\":1}");
    }

    #[tokio::test]
    async fn restore_without_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryBackupStore::new(dir.path());
        let err = store.restore_latest("data", &dir.path().join("live")).await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(c) if c == "data"));
    }

    #[test]
    fn copy_tree_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        write(&from.join("a.toml"), "a = 1");
        write(&from.join("nested/b.json"), "{}");
        fs::create_dir_all(from.join("empty")).unwrap();

        let to = dir.path().join("to");
        assert_eq!(copy_tree(&from, &to).unwrap(), 2);
        assert!(to.join("nested/b.json").is_file());
        assert!(to.join("empty").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_keeps_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        write(&from.join("sites/main.conf"), "listen 80");
        fs::create_dir_all(from.join("enabled")).unwrap();
        std::os::unix::fs::symlink("../sites/main.conf", from.join("enabled/main.conf")).unwrap();

        let to = dir.path().join("to");
        assert_eq!(copy_tree(&from, &to).unwrap(), 2);

        let link = to.join("enabled/main.conf");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("../sites/main.conf"));
        assert_eq!(fs::read_to_string(&link).unwrap(), "listen 80");
    }
}
