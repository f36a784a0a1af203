//! A single unit of work against a scope.

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::info;

use super::command::{self, RunOutcome};
use super::models::{OperationStatus, Record, Scope};
use super::operation_server::OperationServer;
use super::operation_type::OperationType;
use crate::config::AppConfig;
use crate::error::{OperationError, Result};

/// Longest accepted caller-supplied ID, well below common file name limits.
pub const MAX_ID_LEN: usize = 200;

static VALID_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,199}$").unwrap());

/// Last generated ID, as microseconds since the epoch.
static LAST_ISSUED_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

#[derive(Debug, Clone)]
pub struct Operation {
    id: String,
    op_type: OperationType,
    server: OperationServer,
}

impl Operation {
    /// Resolve `scope` and build a new operation, generating an ID if none is
    /// given.
    pub fn create(
        config: &AppConfig,
        scope: Scope,
        op_type: OperationType,
        id: Option<String>,
    ) -> Result<Self> {
        let server = OperationServer::resolve(config, scope)?;
        Self::new(server, op_type, id)
    }

    pub fn new(server: OperationServer, op_type: OperationType, id: Option<String>) -> Result<Self> {
        op_type.check_scope(server.scope())?;

        let id = match id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => generate_id(),
        };

        Ok(Self {
            id,
            op_type,
            server,
        })
    }

    /// Re-open a registered operation by ID, checking its recorded type.
    pub fn load(server: OperationServer, op_type: OperationType, id: &str) -> Result<Self> {
        let operation = Self::new(server, op_type, Some(id.to_string()))?;
        let content = operation.read_job_file()?;

        let recorded = content
            .get("operation_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if recorded != op_type.as_str() {
            return Err(OperationError::MalformedContent(format!(
                "Operation '{}' is of type '{}', not '{}'",
                id, recorded, op_type
            )));
        }

        Ok(operation)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn scope(&self) -> &Scope {
        self.server.scope()
    }

    pub fn server(&self) -> &OperationServer {
        &self.server
    }

    /// Current local time in the format used for `start_time`/`end_time`.
    pub fn time_event_now() -> String {
        Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }

    /// Register the operation: stamp `operation_type` and `start_time` into
    /// `content`, validate it, and persist it as the job record.
    ///
    /// Returns the record as written.
    pub fn write_job_file(&self, mut content: Record) -> Result<Record> {
        content.insert("operation_type".to_string(), self.op_type.as_str().into());
        content.insert("start_time".to_string(), Self::time_event_now().into());

        self.op_type.validate(&content)?;
        self.server.write_job_file(&self.id, &content)?;

        info!(
            operation_id = %self.id,
            scope = %self.scope(),
            operation_type = %self.op_type,
            "Operation registered"
        );
        Ok(content)
    }

    pub fn read_job_file(&self) -> Result<Record> {
        self.server.read_job_file(&self.id)
    }

    pub fn read_output_file(&self) -> Result<Record> {
        self.server.read_output_file(&self.id)
    }

    pub fn write_output_file(&self, content: &Record) -> Result<()> {
        self.server.write_output_file(&self.id, content)
    }

    pub fn get_status(&self) -> Result<OperationStatus> {
        self.server.get_operation_status(&self.id)
    }

    /// Run the external command for this operation and wait for it.
    ///
    /// Errors only if the job record cannot be read or no longer validates;
    /// command failures are part of the returned outcome.
    pub async fn run(&self, barman_command: &Path, timeout: Option<Duration>) -> Result<RunOutcome> {
        let operation = self.clone();
        let content = tokio::task::spawn_blocking(move || operation.read_job_file()).await??;
        let args = self.op_type.command_args(self.scope(), &content)?;

        info!(
            operation_id = %self.id,
            operation_type = %self.op_type,
            command = %barman_command.display(),
            "Running operation"
        );

        Ok(command::run_captured(barman_command, &args, timeout).await)
    }
}

/// Check a caller-supplied ID is usable as a file name: at most
/// [`MAX_ID_LEN`] characters, no path separators, no leading dot.
pub fn validate_id(id: &str) -> Result<()> {
    if VALID_ID.is_match(id) {
        Ok(())
    } else {
        Err(OperationError::InvalidId(id.to_string()))
    }
}

/// Timestamp-based ID, strictly increasing within this process.
///
/// Format: `%Y%m%dT%H%M%S` in UTC followed by six microsecond digits. UTC keeps
/// the order stable when the local clock falls back.
pub fn generate_id() -> String {
    let now = Utc::now().timestamp_micros();

    let previous = LAST_ISSUED_MICROS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or(now);
    let issued = now.max(previous.saturating_add(1));

    let secs = issued.div_euclid(1_000_000);
    let nanos = (issued.rem_euclid(1_000_000) * 1_000) as u32;
    let timestamp = DateTime::from_timestamp(secs, nanos).unwrap_or_default();

    timestamp.format("%Y%m%dT%H%M%S%6f").to_string()
}
