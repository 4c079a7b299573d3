//! Built-in restore steps and the step sets for each run type.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use super::store::BackupStore;
use super::{RestoreAction, RestoreContext, StepConfig, StepId};
use crate::error::{Error, Result};

/// Manifest file every backup carries at its root.
pub const MANIFEST_FILE: &str = "data.json";

/// The fields of `data.json` the restore relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BackupManifest {
    /// Backup format version
    #[serde(default)]
    pub version: Option<u32>,
    /// Creation time in milliseconds since the epoch
    #[serde(default)]
    pub time: Option<i64>,
}

/// Steps for a backup received from another device.
pub fn landrop_restore_steps(store: Arc<dyn BackupStore>) -> Vec<StepConfig> {
    let mut steps = vec![StepConfig::external(StepId::ReceiveFile, "Receive backup file")];
    steps.extend(local_restore_steps(store));
    steps
}

/// Steps for a backup file already on this device.
pub fn local_restore_steps(store: Arc<dyn BackupStore>) -> Vec<StepConfig> {
    vec![
        StepConfig::action(StepId::Extract, "Extract archive", ExtractStep),
        StepConfig::action(StepId::Validate, "Validate backup", ValidateStep),
        StepConfig::action(StepId::Import, "Import data", ImportStep { store }),
    ]
}

/// Unpacks the archive into the run's work directory.
#[derive(Debug, Clone, Copy)]
pub struct ExtractStep;

impl RestoreAction for ExtractStep {
    fn run<'a>(&'a self, ctx: &'a mut RestoreContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let archive = ctx.input.path.clone();
            let dest = ctx.work_dir.join("extracted");
            let out = dest.clone();

            let entries = tokio::task::spawn_blocking(move || extract_zip(&archive, &out))
                .await
                .map_err(|e| Error::Internal(format!("extract task failed: {e}")))??;

            tracing::debug!("Extracted {entries} entries into {}", dest.display());
            ctx.extracted_dir = Some(dest);
            Ok(())
        })
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::InvalidBackup(format!("not a zip archive: {e}")))?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::InvalidBackup(format!("corrupt entry #{i}: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::InvalidBackup(format!(
                "entry '{}' escapes the archive root",
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(zip.len())
}

/// Checks the manifest at the extracted root.
#[derive(Debug, Clone, Copy)]
pub struct ValidateStep;

impl RestoreAction for ValidateStep {
    fn run<'a>(&'a self, ctx: &'a mut RestoreContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let dir = ctx
                .extracted_dir
                .as_ref()
                .ok_or_else(|| Error::InvalidBackup("archive has not been extracted".to_string()))?;

            let path = dir.join(MANIFEST_FILE);
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::InvalidBackup(format!("{MANIFEST_FILE} is missing")));
                }
                Err(e) => return Err(e.into()),
            };

            let manifest = parse_manifest(&raw)?;
            match manifest.time.and_then(chrono::DateTime::from_timestamp_millis) {
                Some(created) => tracing::info!(
                    "Backup version {:?} created {}",
                    manifest.version,
                    created.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => tracing::info!("Backup version {:?}", manifest.version),
            }
            Ok(())
        })
    }
}

/// Parse and check a manifest.
///
/// # Errors
///
/// Returns [`Error::InvalidBackup`] if the manifest is not a JSON object or
/// its version is newer than this build understands.
pub fn parse_manifest(raw: &str) -> Result<BackupManifest> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| Error::InvalidBackup(format!("{MANIFEST_FILE} is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(Error::InvalidBackup(format!(
            "{MANIFEST_FILE} is not a JSON object"
        )));
    }

    let manifest: BackupManifest = serde_json::from_value(value)
        .map_err(|e| Error::InvalidBackup(format!("{MANIFEST_FILE}: {e}")))?;
    if let Some(version) = manifest.version {
        if version > crate::SUPPORTED_BACKUP_VERSION {
            return Err(Error::InvalidBackup(format!(
                "backup version {version} is newer than supported version {}",
                crate::SUPPORTED_BACKUP_VERSION
            )));
        }
    }
    Ok(manifest)
}

/// Hands the extracted backup to the store.
pub struct ImportStep {
    store: Arc<dyn BackupStore>,
}

impl std::fmt::Debug for ImportStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportStep").finish_non_exhaustive()
    }
}

impl RestoreAction for ImportStep {
    fn run<'a>(&'a self, ctx: &'a mut RestoreContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let input = &ctx.input;
            let mut handle = self.store.create_archive_handle(
                &input.name,
                &input.path,
                input.size,
                &input.mime_type,
            );
            if let Some(dir) = &ctx.extracted_dir {
                handle = handle.with_extracted_dir(dir);
            }

            self.store.import_from_archive(&handle).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::restore::{
        FsBackupStore, OverallStatus, RestoreInput, RestoreStepRunner, StartOptions, StepStatus,
    };

    fn build_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, contents) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = parse_manifest(r#"{"version":5,"time":1700000000000,"localStorage":{}}"#)
            .unwrap();
        assert_eq!(manifest.version, Some(5));
        assert_eq!(manifest.time, Some(1_700_000_000_000));

        assert_eq!(parse_manifest("{}").unwrap(), BackupManifest::default());
        assert!(parse_manifest(r#"{"version":6}"#).is_err());
        assert!(parse_manifest("[1,2]").is_err());
        assert!(parse_manifest("not json").is_err());
    }

    #[tokio::test]
    async fn test_local_restore_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("backup.zip");
        build_zip(
            &archive,
            &[("data.json", r#"{"version":5}"#), ("Files/note.md", "# hi")],
        );

        let store = FsBackupStore::new(dir.path().join("data"));
        let runner = RestoreStepRunner::new().configure(local_restore_steps(Arc::new(store.clone())));
        let input = RestoreInput::from_path(&archive).unwrap();
        assert_eq!(input.mime_type, "application/zip");

        let overall = runner.start(input, StartOptions::default()).await.unwrap();
        assert_eq!(overall, OverallStatus::Success);
        assert!(store.restored_dir().join("Files/note.md").exists());
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_validate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("backup.zip");
        build_zip(&archive, &[("other.txt", "x")]);

        let store = Arc::new(FsBackupStore::new(dir.path().join("data")));
        let runner = RestoreStepRunner::new().configure(local_restore_steps(store));
        let input = RestoreInput::from_path(&archive).unwrap();

        assert_eq!(
            runner.start(input, StartOptions::default()).await.unwrap(),
            OverallStatus::Error
        );
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.step(StepId::Extract).unwrap().status, StepStatus::Completed);
        let validate = snapshot.step(StepId::Validate).unwrap();
        assert_eq!(validate.status, StepStatus::Error);
        assert!(validate.message.as_deref().unwrap().contains("data.json"));
        assert_eq!(snapshot.step(StepId::Import).unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_non_zip_fails_extract() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("backup.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();

        let store = Arc::new(FsBackupStore::new(dir.path().join("data")));
        let runner = RestoreStepRunner::new().configure(local_restore_steps(store));
        let input = RestoreInput::from_path(&archive).unwrap();

        runner.start(input, StartOptions::default()).await.unwrap();
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.step(StepId::Extract).unwrap().status, StepStatus::Error);
        assert_eq!(snapshot.step(StepId::Validate).unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_landrop_steps_start_with_receive() {
        let store = Arc::new(FsBackupStore::new("/tmp/unused"));
        let ids: Vec<StepId> = landrop_restore_steps(store).iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![StepId::ReceiveFile, StepId::Extract, StepId::Validate, StepId::Import]
        );
    }
}
