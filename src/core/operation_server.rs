//! Scope resolution, listing and status lookup for operations.
//!
//! An [`OperationServer`] binds a [`Scope`] to its storage. It never caches
//! records: every query goes back to disk, so answers stay correct across
//! restarts and while workers write concurrently.

use std::path::PathBuf;
use tracing::warn;

use super::models::{OperationStatus, OperationSummary, Record, Scope};
use super::operation_type::OperationType;
use crate::config::AppConfig;
use crate::error::{OperationError, RecordKind, Result};
use crate::store::JobStore;

const JOB_REQUIRED_KEYS: &[&str] = &["operation_type", "start_time"];
const OUTPUT_REQUIRED_KEYS: &[&str] = &["end_time", "output", "success"];

#[derive(Debug, Clone)]
pub struct OperationServer {
    scope: Scope,
    store: JobStore,
}

impl OperationServer {
    /// Resolve a scope against the configuration and make sure its
    /// directories exist.
    pub fn resolve(config: &AppConfig, scope: Scope) -> Result<Self> {
        if let Scope::Server(name) = &scope {
            if config.server(name).is_none() {
                return Err(OperationError::ScopeConfig(name.clone()));
            }
        }

        let store = JobStore::new(&config.barman_home);
        store.ensure_scope_dirs(&scope)?;

        Ok(Self { scope, store })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn jobs_basedir(&self) -> PathBuf {
        self.store.record_dir(&self.scope, RecordKind::Job)
    }

    pub fn output_basedir(&self) -> PathBuf {
        self.store.record_dir(&self.scope, RecordKind::Output)
    }

    pub fn job_file_path(&self, id: &str) -> PathBuf {
        self.store.record_path(&self.scope, RecordKind::Job, id)
    }

    pub fn output_file_path(&self, id: &str) -> PathBuf {
        self.store.record_path(&self.scope, RecordKind::Output, id)
    }

    pub fn write_job_file(&self, id: &str, content: &Record) -> Result<()> {
        check_required(RecordKind::Job, id, content, JOB_REQUIRED_KEYS)?;
        self.store.write(&self.scope, RecordKind::Job, id, content)
    }

    pub fn write_output_file(&self, id: &str, content: &Record) -> Result<()> {
        check_required(RecordKind::Output, id, content, OUTPUT_REQUIRED_KEYS)?;
        if !content.get("success").is_some_and(|v| v.is_boolean()) {
            return Err(OperationError::MalformedContent(format!(
                "Output file for operation '{}' has invalid keys: success",
                id
            )));
        }
        self.store.write(&self.scope, RecordKind::Output, id, content)
    }

    pub fn read_job_file(&self, id: &str) -> Result<Record> {
        self.store.read(&self.scope, RecordKind::Job, id)
    }

    pub fn read_output_file(&self, id: &str) -> Result<Record> {
        self.store.read(&self.scope, RecordKind::Output, id)
    }

    /// Every operation with a job record in this scope, sorted by ID.
    ///
    /// With `type_filter`, only operations of that type are returned.
    pub fn list_operations(&self, type_filter: Option<OperationType>) -> Result<Vec<OperationSummary>> {
        let mut operations = Vec::new();

        for id in self.store.list(&self.scope, RecordKind::Job)? {
            let content = match self.read_job_file(&id) {
                Ok(content) => content,
                Err(e) => {
                    warn!(operation_id = %id, scope = %self.scope, error = %e, "Skipping unreadable job file");
                    continue;
                }
            };

            let op_type = content
                .get("operation_type")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            if let Some(filter) = type_filter {
                if op_type != filter.as_str() {
                    continue;
                }
            }

            operations.push(OperationSummary { id, op_type });
        }

        Ok(operations)
    }

    /// Status of an operation, derived from which records exist.
    pub fn get_operation_status(&self, id: &str) -> Result<OperationStatus> {
        match self.read_output_file(id) {
            Ok(output) => {
                let success = output
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                Ok(if success {
                    OperationStatus::Done
                } else {
                    OperationStatus::Failed
                })
            }
            Err(OperationError::NotFound { .. }) => match self.read_job_file(id) {
                Ok(_) => Ok(OperationStatus::InProgress),
                Err(OperationError::NotFound { .. }) => {
                    Err(OperationError::OperationNotExists(id.to_string()))
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}

fn check_required(kind: RecordKind, id: &str, content: &Record, keys: &[&str]) -> Result<()> {
    let mut missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|key| !content.contains_key(*key))
        .collect();
    missing.sort_unstable();

    if missing.is_empty() {
        return Ok(());
    }

    Err(OperationError::MalformedContent(format!(
        "{} file for operation '{}' is missing required keys: {}",
        kind,
        id,
        missing.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::{Value, json};
    use tempfile::{TempDir, tempdir};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (TempDir, AppConfig) {
        let temp = tempdir().unwrap();
        let mut config = AppConfig {
            barman_home: temp.path().to_path_buf(),
            ..Default::default()
        };
        config
            .servers
            .insert("pg".to_string(), ServerConfig::default());
        (temp, config)
    }

    fn job(op_type: &str) -> Record {
        record(json!({
            "operation_type": op_type,
            "start_time": "2024-01-01T00:00:00.000000",
        }))
    }

    fn output(success: bool) -> Record {
        record(json!({
            "success": success,
            "end_time": "2024-01-01T00:10:00.000000",
            "output": "done",
        }))
    }

    #[test]
    fn test_resolve_creates_scope_dirs() {
        let (temp, config) = setup();

        let server = OperationServer::resolve(&config, Scope::Server("pg".into())).unwrap();
        assert_eq!(server.jobs_basedir(), temp.path().join("pg/jobs"));
        assert_eq!(server.output_basedir(), temp.path().join("pg/output"));
        assert!(server.jobs_basedir().is_dir());

        let instance = OperationServer::resolve(&config, Scope::Instance).unwrap();
        assert_eq!(instance.jobs_basedir(), temp.path().join("jobs"));
        assert!(instance.output_basedir().is_dir());
    }

    #[test]
    fn test_resolve_unknown_server() {
        let (_temp, config) = setup();

        let err = OperationServer::resolve(&config, Scope::Server("other".into())).unwrap_err();
        assert_eq!(err.to_string(), "No barman config found for 'other'.");
    }

    #[test]
    fn test_write_job_file_missing_keys() {
        let (_temp, config) = setup();
        let server = OperationServer::resolve(&config, Scope::Server("pg".into())).unwrap();

        let cases = [
            (json!({}), "operation_type, start_time"),
            (json!({"operation_type": "recovery"}), "start_time"),
            (json!({"start_time": "now"}), "operation_type"),
        ];

        for (content, missing) in cases {
            let err = server.write_job_file("op-1", &record(content)).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("Job file for operation 'op-1' is missing required keys: {missing}")
            );
        }
    }

    #[test]
    fn test_write_output_file_missing_keys() {
        let (_temp, config) = setup();
        let server = OperationServer::resolve(&config, Scope::Instance).unwrap();

        let err = server
            .write_output_file("op-1", &record(json!({"output": "x"})))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Output file for operation 'op-1' is missing required keys: end_time, success"
        );

        let err = server
            .write_output_file(
                "op-1",
                &record(json!({"output": "x", "end_time": "t", "success": "yes"})),
            )
            .unwrap_err();
        assert!(matches!(err, OperationError::MalformedContent(_)));
    }

    #[test]
    fn test_status_for_every_record_combination() {
        let (_temp, config) = setup();
        let server = OperationServer::resolve(&config, Scope::Server("pg".into())).unwrap();

        // Neither record.
        let err = server.get_operation_status("none").unwrap_err();
        assert_eq!(err.to_string(), "Operation 'none' does not exist");

        // Job only.
        server.write_job_file("running", &job("recovery")).unwrap();
        assert_eq!(
            server.get_operation_status("running").unwrap(),
            OperationStatus::InProgress
        );

        // Job and successful output.
        server.write_job_file("ok", &job("recovery")).unwrap();
        server.write_output_file("ok", &output(true)).unwrap();
        assert_eq!(server.get_operation_status("ok").unwrap(), OperationStatus::Done);

        // Job and failed output.
        server.write_job_file("ko", &job("recovery")).unwrap();
        server.write_output_file("ko", &output(false)).unwrap();
        assert_eq!(server.get_operation_status("ko").unwrap(), OperationStatus::Failed);

        // Output only still counts as terminal.
        server.write_output_file("orphan", &output(true)).unwrap();
        assert_eq!(
            server.get_operation_status("orphan").unwrap(),
            OperationStatus::Done
        );
    }

    #[test]
    fn test_list_operations_with_and_without_filter() {
        let (temp, config) = setup();
        let server = OperationServer::resolve(&config, Scope::Server("pg".into())).unwrap();

        server.write_job_file("op-1", &job("recovery")).unwrap();
        server.write_job_file("op-2", &job("config_switch")).unwrap();
        server.write_job_file("op-3", &job("recovery")).unwrap();
        std::fs::write(temp.path().join("pg/jobs/readme.txt"), b"ignored").unwrap();

        let all = server.list_operations(None).unwrap();
        assert_eq!(
            all,
            vec![
                OperationSummary { id: "op-1".into(), op_type: "recovery".into() },
                OperationSummary { id: "op-2".into(), op_type: "config_switch".into() },
                OperationSummary { id: "op-3".into(), op_type: "recovery".into() },
            ]
        );

        let recoveries = server.list_operations(Some(OperationType::Recovery)).unwrap();
        let expected: Vec<_> = all
            .iter()
            .filter(|op| op.op_type == "recovery")
            .cloned()
            .collect();
        assert_eq!(recoveries, expected);

        assert!(server
            .list_operations(Some(OperationType::ConfigUpdate))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_list_operations_skips_corrupt_job_files() {
        let (temp, config) = setup();
        let server = OperationServer::resolve(&config, Scope::Server("pg".into())).unwrap();

        server.write_job_file("good", &job("recovery")).unwrap();
        std::fs::write(temp.path().join("pg/jobs/bad.json"), b"not json").unwrap();

        let ids: Vec<_> = server
            .list_operations(None)
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec!["good".to_string()]);
    }
}
