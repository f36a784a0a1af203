//! Read-only view of a server's base backups, used to resolve backup IDs.
//!
//! Each backup lives in `<basebackups_directory>/<backup_id>/` and carries a
//! `backup.info` file of `key=value` lines. Only the `status` key is needed
//! here. Backup IDs are timestamps, so sorting them sorts by age.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::AppConfig;
use crate::error::{OperationError, Result};

const BACKUP_INFO_FILE: &str = "backup.info";

/// Statuses of a backup that can be recovered from.
const USABLE_STATUSES: &[&str] = &["DONE", "WAITING_FOR_WALS"];
const FAILED_STATUS: &str = "FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub backup_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct BackupCatalog {
    basebackups_dir: PathBuf,
}

impl BackupCatalog {
    pub fn new(basebackups_dir: impl Into<PathBuf>) -> Self {
        Self {
            basebackups_dir: basebackups_dir.into(),
        }
    }

    /// Catalog of a configured server.
    pub fn for_server(config: &AppConfig, server_name: &str) -> Result<Self> {
        config
            .basebackups_directory(server_name)
            .map(Self::new)
            .ok_or_else(|| OperationError::ScopeConfig(server_name.to_string()))
    }

    /// All backups with a readable `backup.info`, oldest first.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let entries = match fs::read_dir(&self.basebackups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OperationError::io(&self.basebackups_dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| OperationError::io(&self.basebackups_dir, e))?;
            let Ok(backup_id) = entry.file_name().into_string() else {
                continue;
            };

            match read_status(&entry.path().join(BACKUP_INFO_FILE)) {
                Some(status) => backups.push(BackupInfo { backup_id, status }),
                None => debug!(backup_id = %backup_id, "Skipping directory without backup.info"),
            }
        }

        backups.sort_by(|a, b| a.backup_id.cmp(&b.backup_id));
        Ok(backups)
    }

    /// Turn a requested backup ID into a concrete one.
    ///
    /// `latest`/`last` and `oldest`/`first` pick among usable backups,
    /// `last-failed` picks the newest failed one. Anything else must name an
    /// existing backup.
    pub fn resolve(&self, requested: &str) -> Result<String> {
        let backups = self.list()?;
        let usable = |b: &&BackupInfo| USABLE_STATUSES.contains(&b.status.as_str());

        let found = match requested {
            "latest" | "last" => backups.iter().rev().find(usable),
            "oldest" | "first" => backups.iter().find(usable),
            "last-failed" => backups.iter().rev().find(|b| b.status == FAILED_STATUS),
            literal => backups.iter().find(|b| b.backup_id == literal),
        };

        found
            .map(|b| b.backup_id.clone())
            .ok_or_else(|| OperationError::BackupNotFound(requested.to_string()))
    }
}

fn read_status(info_path: &Path) -> Option<String> {
    let content = fs::read_to_string(info_path).ok()?;

    let status = content
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "status")
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default();

    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn add_backup(dir: &Path, id: &str, status: &str) {
        let backup_dir = dir.join(id);
        fs::create_dir_all(&backup_dir).unwrap();
        fs::write(
            backup_dir.join(BACKUP_INFO_FILE),
            format!("backup_id={id}\nbegin_wal=000000010000000000000002\nstatus={status}\n"),
        )
        .unwrap();
    }

    fn catalog() -> (tempfile::TempDir, BackupCatalog) {
        let temp = tempdir().unwrap();
        add_backup(temp.path(), "20240101T000000", "FAILED");
        add_backup(temp.path(), "20240102T000000", "DONE");
        add_backup(temp.path(), "20240103T000000", "WAITING_FOR_WALS");
        add_backup(temp.path(), "20240104T000000", "FAILED");
        add_backup(temp.path(), "20240105T000000", "STARTED");
        fs::create_dir_all(temp.path().join("not-a-backup")).unwrap();

        let catalog = BackupCatalog::new(temp.path());
        (temp, catalog)
    }

    #[test]
    fn test_list_is_sorted_and_skips_incomplete_dirs() {
        let (_temp, catalog) = catalog();

        let ids: Vec<_> = catalog.list().unwrap().into_iter().map(|b| b.backup_id).collect();
        assert_eq!(
            ids,
            vec![
                "20240101T000000",
                "20240102T000000",
                "20240103T000000",
                "20240104T000000",
                "20240105T000000",
            ]
        );
    }

    #[test]
    fn test_resolve_symbolic_ids() {
        let (_temp, catalog) = catalog();

        assert_eq!(catalog.resolve("latest").unwrap(), "20240103T000000");
        assert_eq!(catalog.resolve("last").unwrap(), "20240103T000000");
        assert_eq!(catalog.resolve("oldest").unwrap(), "20240102T000000");
        assert_eq!(catalog.resolve("first").unwrap(), "20240102T000000");
        assert_eq!(catalog.resolve("last-failed").unwrap(), "20240104T000000");
    }

    #[test]
    fn test_resolve_literal_ids() {
        let (_temp, catalog) = catalog();

        assert_eq!(catalog.resolve("20240105T000000").unwrap(), "20240105T000000");

        let err = catalog.resolve("20991231T000000").unwrap_err();
        assert_eq!(err.to_string(), "Backup '20991231T000000' does not exist");

        let err = catalog.resolve("../20240102T000000").unwrap_err();
        assert!(matches!(err, OperationError::BackupNotFound(_)));
    }

    #[test]
    fn test_resolve_on_empty_catalog() {
        let temp = tempdir().unwrap();
        let catalog = BackupCatalog::new(temp.path().join("missing"));

        assert!(catalog.list().unwrap().is_empty());
        assert!(matches!(
            catalog.resolve("latest"),
            Err(OperationError::BackupNotFound(_))
        ));
    }
}
