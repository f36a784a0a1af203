//! Executing registered operations and recording their outcome.
//!
//! This is what a worker runs, whether in-process or as a detached CLI
//! subcommand: load the operation by ID, run its command, and write the output
//! record. It also covers the paths that end an operation without running it.

use std::fmt;

use tracing::{info, warn};

use super::models::{OperationStatus, Record, Scope};
use super::operation::{Operation, validate_id};
use super::operation_server::OperationServer;
use super::operation_type::OperationType;
use crate::context::AppContext;
use crate::error::{OperationError, RecordKind, Result};

/// A registered operation waiting to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub scope: Scope,
    pub op_type: OperationType,
    pub operation_id: String,
}

impl Dispatch {
    pub fn new(operation: &Operation) -> Self {
        Self {
            scope: operation.scope().clone(),
            op_type: operation.op_type(),
            operation_id: operation.id().to_string(),
        }
    }

    /// Arguments of the CLI worker subcommand that executes this operation.
    pub fn cli_args(&self) -> Vec<String> {
        let mut args = vec![self.op_type.subcommand().to_string()];
        if let Some(name) = self.scope.server_name() {
            args.push("--server-name".to_string());
            args.push(name.to_string());
        }
        args.push("--operation-id".to_string());
        args.push(self.operation_id.clone());
        args
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation '{}' ({})", self.op_type, self.operation_id, self.scope)
    }
}

/// Run the operation and write its output record.
///
/// Returns whether the external command succeeded. Errors mean the operation
/// could not be run or its outcome could not be recorded.
pub async fn execute(ctx: &AppContext, dispatch: &Dispatch) -> Result<bool> {
    let config = ctx.config.clone();
    let target = dispatch.clone();
    let operation = tokio::task::spawn_blocking(move || {
        let server = OperationServer::resolve(&config, target.scope)?;
        Operation::load(server, target.op_type, &target.operation_id)
    })
    .await??;

    let outcome = operation
        .run(&ctx.config.barman_command, ctx.config.command_timeout())
        .await?;

    let success = outcome.success();
    let output = outcome.output;
    tokio::task::spawn_blocking(move || {
        let mut content = operation.read_job_file()?;
        content.insert("success".to_string(), success.into());
        content.insert("end_time".to_string(), Operation::time_event_now().into());
        content.insert("output".to_string(), output.into());
        operation.write_output_file(&content)
    })
    .await??;

    if success {
        info!(
            operation_id = %dispatch.operation_id,
            scope = %dispatch.scope,
            operation_type = %dispatch.op_type,
            "Operation finished"
        );
    } else {
        warn!(
            operation_id = %dispatch.operation_id,
            scope = %dispatch.scope,
            operation_type = %dispatch.op_type,
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            "Operation failed"
        );
    }

    Ok(success)
}

/// Mark an operation FAILED without running it, e.g. when it could not be
/// scheduled or its worker died.
pub fn record_failure(ctx: &AppContext, dispatch: &Dispatch, message: &str) -> Result<()> {
    let server = OperationServer::resolve(&ctx.config, dispatch.scope.clone())?;
    finish_unsuccessfully(&server, &dispatch.operation_id, message, false)?;

    warn!(
        operation_id = %dispatch.operation_id,
        scope = %dispatch.scope,
        operation_type = %dispatch.op_type,
        reason = message,
        "Operation recorded as failed"
    );
    Ok(())
}

/// End an IN_PROGRESS operation as FAILED, flagged `abandoned`.
///
/// Terminal operations are left alone and reported as `AlreadyExists`.
pub fn abandon(ctx: &AppContext, scope: Scope, operation_id: &str, reason: &str) -> Result<()> {
    validate_id(operation_id)?;
    let server = OperationServer::resolve(&ctx.config, scope)?;

    if server.get_operation_status(operation_id)? != OperationStatus::InProgress {
        return Err(OperationError::AlreadyExists {
            kind: RecordKind::Output,
            id: operation_id.to_string(),
        });
    }

    finish_unsuccessfully(&server, operation_id, reason, true)?;

    info!(
        operation_id = %operation_id,
        scope = %server.scope(),
        reason = reason,
        "Operation abandoned"
    );
    Ok(())
}

fn finish_unsuccessfully(
    server: &OperationServer,
    operation_id: &str,
    message: &str,
    abandoned: bool,
) -> Result<()> {
    let mut content = match server.read_job_file(operation_id) {
        Ok(content) => content,
        Err(OperationError::NotFound { .. }) => Record::new(),
        Err(e) => return Err(e),
    };

    content.insert("success".to_string(), false.into());
    content.insert("end_time".to_string(), Operation::time_event_now().into());
    content.insert("output".to_string(), message.into());
    if abandoned {
        content.insert("abandoned".to_string(), true.into());
    }

    server.write_output_file(operation_id, &content)
}
