//! Storage collaborator for the import step.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A backup archive registered with a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHandle {
    /// Store-assigned identifier
    pub id: Uuid,
    /// Archive file name
    pub name: String,
    /// Where the archive lives
    pub uri: PathBuf,
    /// Archive size in bytes
    pub size: u64,
    /// Archive MIME type
    pub mime_type: String,
    /// Unpacked contents, once extracted
    pub extracted_dir: Option<PathBuf>,
}

impl ArchiveHandle {
    /// Attach the directory the archive was unpacked into.
    #[must_use]
    pub fn with_extracted_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extracted_dir = Some(dir.into());
        self
    }
}

/// Totals reported by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Files imported
    pub files: u64,
    /// Bytes imported
    pub bytes: u64,
}

/// Local datastore a backup is imported into.
pub trait BackupStore: Send + Sync {
    /// Register an archive for import.
    fn create_archive_handle(
        &self,
        name: &str,
        uri: &Path,
        size: u64,
        mime_type: &str,
    ) -> ArchiveHandle;

    /// Import the archive's contents.
    fn import_from_archive<'a>(
        &'a self,
        handle: &'a ArchiveHandle,
    ) -> BoxFuture<'a, Result<ImportSummary>>;
}

/// Imports backups into `<data_dir>/restored`.
///
/// The new tree is staged next to the target and swapped in only once fully
/// copied, so a failed import leaves the previous one in place.
#[derive(Debug, Clone)]
pub struct FsBackupStore {
    data_dir: PathBuf,
}

impl FsBackupStore {
    /// Store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Directory holding the most recent import.
    #[must_use]
    pub fn restored_dir(&self) -> PathBuf {
        self.data_dir.join("restored")
    }
}

impl BackupStore for FsBackupStore {
    fn create_archive_handle(
        &self,
        name: &str,
        uri: &Path,
        size: u64,
        mime_type: &str,
    ) -> ArchiveHandle {
        ArchiveHandle {
            id: Uuid::new_v4(),
            name: name.to_string(),
            uri: uri.to_path_buf(),
            size,
            mime_type: mime_type.to_string(),
            extracted_dir: None,
        }
    }

    fn import_from_archive<'a>(
        &'a self,
        handle: &'a ArchiveHandle,
    ) -> BoxFuture<'a, Result<ImportSummary>> {
        Box::pin(async move {
            let source = handle.extracted_dir.clone().ok_or_else(|| {
                Error::InvalidBackup(format!("'{}' has not been extracted", handle.name))
            })?;
            let target = self.restored_dir();
            let staging = self.data_dir.join(format!(".restored-{}", handle.id));
            let previous = self.data_dir.join(format!(".previous-{}", handle.id));

            let summary = tokio::task::spawn_blocking(move || -> Result<ImportSummary> {
                let summary = copy_tree(&source, &staging).inspect_err(|_| {
                    let _ = std::fs::remove_dir_all(&staging);
                })?;
                swap_into_place(&staging, &target, &previous).inspect_err(|_| {
                    let _ = std::fs::remove_dir_all(&staging);
                })?;
                Ok(summary)
            })
            .await
            .map_err(|e| Error::Internal(format!("import task failed: {e}")))??;

            tracing::info!(
                "Imported {} file(s), {} bytes into {}",
                summary.files,
                summary.bytes,
                self.restored_dir().display()
            );
            Ok(summary)
        })
    }
}

/// Move `staging` to `target`, keeping the old `target` at `previous` until
/// the new tree is in place.
fn swap_into_place(staging: &Path, target: &Path, previous: &Path) -> std::io::Result<()> {
    let had_previous = target.exists();
    if had_previous {
        std::fs::rename(target, previous)?;
    }

    if let Err(e) = std::fs::rename(staging, target) {
        if had_previous {
            if let Err(restore) = std::fs::rename(previous, target) {
                tracing::error!(
                    "Could not restore previous import from {}: {restore}",
                    previous.display()
                );
            }
        }
        return Err(e);
    }

    if had_previous {
        if let Err(e) = std::fs::remove_dir_all(previous) {
            tracing::warn!("Failed to remove {}: {e}", previous.display());
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    std::fs::create_dir_all(dest)?;

    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            summary.bytes += std::fs::copy(entry.path(), &target)?;
            summary.files += 1;
        } else {
            tracing::debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }

    Ok(summary)
}
