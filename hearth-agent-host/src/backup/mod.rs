//! World backups
//!
//! Archives `<data>/<id>/config/worlds_local` (or `worlds` on older images)
//! into `<data>/backups/<id>-YYYYMMDD-HHMMSS.tar.gz` with the system `tar`.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::info;

const WORLD_DIRS: [&str; 2] = ["worlds_local", "worlds"];

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("no world directory under {0}")]
    NoWorldDir(PathBuf),
    #[error("backup I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("tar failed: {0}")]
    Archive(String),
}

/// A written archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl BackupArchive {
    /// Ack result understood by the kernel: `<path>|<size>`
    pub fn ack_result(&self) -> String {
        format!("{}|{}", self.path.display(), self.size_bytes)
    }
}

/// First existing world directory of an instance
pub fn world_dir(data_path: &Path, instance_id: &str) -> Option<PathBuf> {
    let config_dir = data_path.join(instance_id).join("config");
    WORLD_DIRS.iter().map(|d| config_dir.join(d)).find(|p| p.is_dir())
}

pub fn archive_name(instance_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.tar.gz", instance_id, at.format("%Y%m%d-%H%M%S"))
}

pub async fn create_backup(data_path: &Path, backups_dir: &Path, instance_id: &str) -> Result<BackupArchive, BackupError> {
    let source = world_dir(data_path, instance_id)
        .ok_or_else(|| BackupError::NoWorldDir(data_path.join(instance_id).join("config")))?;
    tokio::fs::create_dir_all(backups_dir).await?;
    let dest = backups_dir.join(archive_name(instance_id, Utc::now()));

    let output = AsyncCommand::new("tar")
        .arg("-czf")
        .arg(&dest)
        .arg("-C")
        .arg(&source)
        .arg(".")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(BackupError::Archive(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }

    let size_bytes = tokio::fs::metadata(&dest).await?.len();
    info!("Backup of {} written to {} ({} bytes)", instance_id, dest.display(), size_bytes);
    Ok(BackupArchive { path: dest, size_bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_archive_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap();
        assert_eq!(archive_name("inst-1", at), "inst-1-20240301-090507.tar.gz");
    }

    #[test]
    fn test_world_dir_fallback() {
        let data = tempfile::tempdir().unwrap();
        assert_eq!(world_dir(data.path(), "a"), None);

        let legacy = data.path().join("a/config/worlds");
        std::fs::create_dir_all(&legacy).unwrap();
        assert_eq!(world_dir(data.path(), "a"), Some(legacy));

        let current = data.path().join("a/config/worlds_local");
        std::fs::create_dir_all(&current).unwrap();
        assert_eq!(world_dir(data.path(), "a"), Some(current));
    }

    #[tokio::test]
    async fn test_backup_writes_archive() {
        let data = tempfile::tempdir().unwrap();
        let worlds = data.path().join("inst-1/config/worlds_local");
        std::fs::create_dir_all(&worlds).unwrap();
        std::fs::write(worlds.join("Midgard.db"), vec![7u8; 4096]).unwrap();

        let backups = data.path().join("backups");
        let archive = create_backup(data.path(), &backups, "inst-1").await.unwrap();

        assert!(archive.path.starts_with(&backups));
        assert!(archive.path.to_string_lossy().ends_with(".tar.gz"));
        assert!(archive.size_bytes > 0);
        assert_eq!(archive.ack_result(), format!("{}|{}", archive.path.display(), archive.size_bytes));
    }

    #[tokio::test]
    async fn test_missing_world_is_an_error() {
        let data = tempfile::tempdir().unwrap();
        let err = create_backup(data.path(), &data.path().join("backups"), "ghost").await.unwrap_err();
        assert!(matches!(err, BackupError::NoWorldDir(_)));
    }
}
