//! Filesystem-backed, write-once storage of operation records.
//!
//! Layout under `barman_home`:
//!
//! ```text
//! <barman_home>/<server>/jobs/<id>.json     server-scoped job records
//! <barman_home>/<server>/output/<id>.json   server-scoped output records
//! <barman_home>/jobs/<id>.json              instance-scoped job records
//! <barman_home>/output/<id>.json            instance-scoped output records
//! ```
//!
//! Records are written to a temporary file in the target directory and then
//! linked into place without clobbering, so a reader either sees no record or
//! the complete one, and two writers racing on one ID cannot both succeed.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::{Record, Scope};
use crate::error::{OperationError, RecordKind, Result};

const RECORD_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct JobStore {
    barman_home: PathBuf,
}

impl JobStore {
    pub fn new(barman_home: impl Into<PathBuf>) -> Self {
        Self {
            barman_home: barman_home.into(),
        }
    }

    /// Root directory of a scope.
    pub fn scope_dir(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::Server(name) => self.barman_home.join(name),
            Scope::Instance => self.barman_home.clone(),
        }
    }

    pub fn record_dir(&self, scope: &Scope, kind: RecordKind) -> PathBuf {
        self.scope_dir(scope).join(kind.dir_name())
    }

    pub fn record_path(&self, scope: &Scope, kind: RecordKind, id: &str) -> PathBuf {
        self.record_dir(scope, kind).join(format!("{}{}", id, RECORD_SUFFIX))
    }

    /// Create the `jobs` and `output` directories of a scope if missing.
    pub fn ensure_scope_dirs(&self, scope: &Scope) -> Result<()> {
        for kind in [RecordKind::Job, RecordKind::Output] {
            let dir = self.record_dir(scope, kind);
            create_dir(&dir)?;
        }
        Ok(())
    }

    /// Persist a record. Fails with `AlreadyExists` if one is already stored.
    pub fn write(&self, scope: &Scope, kind: RecordKind, id: &str, content: &Record) -> Result<()> {
        let dir = self.record_dir(scope, kind);
        let path = self.record_path(scope, kind, id);

        if path.exists() {
            return Err(OperationError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| OperationError::io(&dir, e))?;
        let tmp_path = tmp.path().to_path_buf();

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, content).map_err(|e| OperationError::Parse {
                path: path.clone(),
                source: e,
            })?;
            writer.flush().map_err(|e| OperationError::io(&tmp_path, e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| OperationError::io(&tmp_path, e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "Record written");
                Ok(())
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                Err(OperationError::AlreadyExists {
                    kind,
                    id: id.to_string(),
                })
            }
            Err(e) => Err(OperationError::io(&path, e.error)),
        }
    }

    /// Load a record. Fails with `NotFound` if it was never written.
    pub fn read(&self, scope: &Scope, kind: RecordKind, id: &str) -> Result<Record> {
        let path = self.record_path(scope, kind, id);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(OperationError::NotFound {
                    kind,
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(OperationError::io(&path, e)),
        };

        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| OperationError::Parse { path, source: e })
    }

    /// IDs of every record of `kind` in the scope, sorted.
    pub fn list(&self, scope: &Scope, kind: RecordKind) -> Result<Vec<String>> {
        let dir = self.record_dir(scope, kind);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OperationError::io(&dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| OperationError::io(&dir, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            match name.strip_suffix(RECORD_SUFFIX) {
                Some(id) if !id.is_empty() && !id.starts_with('.') => ids.push(id.to_string()),
                _ => debug!(file = %name, "Skipping non-record file"),
            }
        }

        ids.sort();
        Ok(ids)
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    // The nearest existing ancestor decides whether the path is usable.
    for ancestor in dir.ancestors() {
        if ancestor.exists() {
            if !ancestor.is_dir() {
                return Err(OperationError::NotADirectory(ancestor.to_path_buf()));
            }
            break;
        }
    }

    fs::create_dir_all(dir).map_err(|e| OperationError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn server() -> Scope {
        Scope::Server("pg".to_string())
    }

    #[test]
    fn test_scope_paths() {
        let store = JobStore::new("/var/lib/barman");

        assert_eq!(
            store.record_path(&server(), RecordKind::Job, "op-1"),
            PathBuf::from("/var/lib/barman/pg/jobs/op-1.json")
        );
        assert_eq!(
            store.record_path(&Scope::Instance, RecordKind::Output, "op-2"),
            PathBuf::from("/var/lib/barman/output/op-2.json")
        );
    }

    #[test]
    fn test_ensure_scope_dirs_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());

        store.ensure_scope_dirs(&server()).unwrap();
        store.ensure_scope_dirs(&server()).unwrap();

        assert!(temp.path().join("pg/jobs").is_dir());
        assert!(temp.path().join("pg/output").is_dir());
    }

    #[test]
    fn test_ensure_scope_dirs_rejects_file_in_path() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("pg"), b"not a directory").unwrap();
        let store = JobStore::new(temp.path());

        let err = store.ensure_scope_dirs(&server()).unwrap_err();
        match err {
            OperationError::NotADirectory(path) => assert_eq!(path, temp.path().join("pg")),
            other => panic!("expected NotADirectory, got {other:?}"),
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());
        store.ensure_scope_dirs(&server()).unwrap();

        let content = record(json!({
            "operation_type": "recovery",
            "start_time": "2024-01-01T00:00:00.000000",
            "backup_id": "20240101T000000",
            "nested": {"a": [1, 2, 3], "b": null},
        }));

        store.write(&server(), RecordKind::Job, "op-1", &content).unwrap();
        let loaded = store.read(&server(), RecordKind::Job, "op-1").unwrap();

        assert_eq!(loaded, content);
    }

    #[test]
    fn test_second_write_fails_and_keeps_first() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());
        store.ensure_scope_dirs(&server()).unwrap();

        let first = record(json!({"value": 1}));
        let second = record(json!({"value": 2}));

        store.write(&server(), RecordKind::Job, "op-1", &first).unwrap();
        let err = store
            .write(&server(), RecordKind::Job, "op-1", &second)
            .unwrap_err();

        assert!(matches!(
            err,
            OperationError::AlreadyExists { kind: RecordKind::Job, .. }
        ));
        assert_eq!(store.read(&server(), RecordKind::Job, "op-1").unwrap(), first);
    }

    #[test]
    fn test_write_leaves_no_temporary_files() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());
        store.ensure_scope_dirs(&server()).unwrap();

        let content = record(json!({"value": 1}));
        store.write(&server(), RecordKind::Job, "op-1", &content).unwrap();
        let _ = store.write(&server(), RecordKind::Job, "op-1", &content);

        let names: Vec<_> = std::fs::read_dir(temp.path().join("pg/jobs"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["op-1.json".to_string()]);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());
        store.ensure_scope_dirs(&Scope::Instance).unwrap();

        let err = store
            .read(&Scope::Instance, RecordKind::Output, "missing")
            .unwrap_err();
        assert!(matches!(
            err,
            OperationError::NotFound { kind: RecordKind::Output, .. }
        ));
    }

    #[test]
    fn test_read_corrupt_record_is_parse_error() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());
        store.ensure_scope_dirs(&server()).unwrap();
        std::fs::write(temp.path().join("pg/jobs/broken.json"), b"{\"half\":").unwrap();

        let err = store.read(&server(), RecordKind::Job, "broken").unwrap_err();
        assert!(matches!(err, OperationError::Parse { .. }));
    }

    #[test]
    fn test_list_skips_non_json_files() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());
        store.ensure_scope_dirs(&server()).unwrap();

        let jobs = temp.path().join("pg/jobs");
        std::fs::write(jobs.join("b.json"), b"{}").unwrap();
        std::fs::write(jobs.join("a.json"), b"{}").unwrap();
        std::fs::write(jobs.join("notes.txt"), b"").unwrap();
        std::fs::write(jobs.join("image.png"), b"").unwrap();
        std::fs::write(jobs.join(".abc123.tmp"), b"").unwrap();

        let ids = store.list(&server(), RecordKind::Job).unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let temp = tempdir().unwrap();
        let store = JobStore::new(temp.path());

        assert!(store.list(&server(), RecordKind::Job).unwrap().is_empty());
    }
}
