//! Supervised execution of registered operations.
//!
//! Submissions go into a bounded queue; a dispatcher task hands them to at
//! most `max_concurrent_operations` workers. Depending on the launch mode a
//! worker runs the operation in-process or as a child process running this
//! binary's worker subcommand.

use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::executor::{self, Dispatch};
use super::models::OperationStatus;
use super::operation_server::OperationServer;
use crate::config::{AppConfig, ENV_PREFIX, LaunchMode};
use crate::context::AppContext;
use crate::error::OperationError;

const SHUTDOWN_REASON: &str = "Operation abandoned: the API server shut down before it started";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Too many pending operations, try again later")]
    QueueFull,
    #[error("The API server is shutting down")]
    ShuttingDown,
}

/// Handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<Dispatch>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Start the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(ctx: AppContext) -> Self {
        let (tx, rx) = mpsc::channel(ctx.config.queue_capacity);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        info!(
            launch_mode = ?ctx.config.launch_mode,
            max_concurrent = ctx.config.max_concurrent_operations,
            queue_capacity = ctx.config.queue_capacity,
            "Worker pool started"
        );

        tracker.spawn(dispatch_loop(ctx, rx, cancel.clone(), tracker.clone()));

        Self {
            tx,
            cancel,
            tracker,
        }
    }

    /// Queue an operation without waiting for room.
    pub fn submit(&self, dispatch: Dispatch) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        debug!(operation_id = %dispatch.operation_id, "Queueing operation");
        self.tx.try_send(dispatch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::ShuttingDown,
        })
    }

    /// Stop accepting work, abandon queued operations and wait for running
    /// ones to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Worker pool stopped");
    }
}

async fn dispatch_loop(
    ctx: AppContext,
    mut rx: mpsc::Receiver<Dispatch>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_operations));

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let dispatch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        let ctx = ctx.clone();
        tracker.spawn(async move {
            let _permit = permit;
            run_worker(&ctx, &dispatch).await;
        });
    }

    rx.close();
    let mut queued = Vec::new();
    while let Ok(dispatch) = rx.try_recv() {
        queued.push(dispatch);
    }
    if queued.is_empty() {
        return;
    }

    let abandoned = tokio::task::spawn_blocking(move || {
        for dispatch in queued {
            if let Err(e) = executor::abandon(
                &ctx,
                dispatch.scope.clone(),
                &dispatch.operation_id,
                SHUTDOWN_REASON,
            ) {
                error!(operation_id = %dispatch.operation_id, error = %e, "Failed to abandon queued operation");
            }
        }
    })
    .await;
    if let Err(e) = abandoned {
        error!(error = %e, "Failed to abandon queued operations");
    }
}

async fn run_worker(ctx: &AppContext, dispatch: &Dispatch) {
    info!(
        operation_id = %dispatch.operation_id,
        scope = %dispatch.scope,
        operation_type = %dispatch.op_type,
        "Starting operation"
    );

    match ctx.config.launch_mode {
        LaunchMode::Worker => {
            if let Err(e) = executor::execute(ctx, dispatch).await {
                error!(operation_id = %dispatch.operation_id, error = %e, "Operation could not be executed");
                fail_if_unfinished(ctx, dispatch, format!("Operation could not be executed: {}", e))
                    .await;
            }
        }
        LaunchMode::Process => {
            // The child normally records the outcome itself; whatever its exit
            // status, an operation still IN_PROGRESS afterwards is failed here.
            let message = match spawn_worker_process(ctx, dispatch).await {
                Ok(status) if status.success() => {
                    "Worker process exited without recording an outcome".to_string()
                }
                Ok(status) => {
                    warn!(operation_id = %dispatch.operation_id, %status, "Worker process did not succeed");
                    format!("Worker process exited with {}", status)
                }
                Err(e) => {
                    warn!(operation_id = %dispatch.operation_id, error = %e, "Failed to start worker process");
                    format!("Failed to start worker process: {}", e)
                }
            };
            fail_if_unfinished(ctx, dispatch, message).await;
        }
    }
}

async fn spawn_worker_process(
    ctx: &AppContext,
    dispatch: &Dispatch,
) -> std::io::Result<std::process::ExitStatus> {
    let exe = match &ctx.config.worker_command {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };

    let mut command = Command::new(exe);
    if let Some(path) = &ctx.config_path {
        command.arg("--config").arg(path);
    }
    command
        .args(dispatch.cli_args())
        .envs(worker_env(&ctx.config))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!(operation_id = %dispatch.operation_id, ?command, "Spawning worker process");
    command.spawn()?.wait().await
}

/// Settings a worker process must share with the server, as `PG_BACKUP_API_*`
/// variables.
///
/// The environment ranks above the config file, so values the server only got
/// from its command line reach the child too.
fn worker_env(config: &AppConfig) -> Vec<(String, String)> {
    let mut vars = vec![
        ("BARMAN_HOME", config.barman_home.display().to_string()),
        ("BARMAN_COMMAND", config.barman_command.display().to_string()),
        ("VERBOSE", config.verbose.to_string()),
        ("JSON_LOGS", config.json_logs.to_string()),
    ];
    if let Some(path) = &config.log_file {
        vars.push(("LOG_FILE", path.display().to_string()));
    }
    if let Some(secs) = config.command_timeout_secs {
        vars.push(("COMMAND_TIMEOUT_SECS", secs.to_string()));
    }

    vars.into_iter()
        .map(|(key, value)| (format!("{}{}", ENV_PREFIX, key), value))
        .collect()
}

/// Write a FAILED output unless the operation already reached a terminal
/// state.
async fn fail_if_unfinished(ctx: &AppContext, dispatch: &Dispatch, message: String) {
    let ctx = ctx.clone();
    let target = dispatch.clone();

    let result = tokio::task::spawn_blocking(move || {
        let server = OperationServer::resolve(&ctx.config, target.scope.clone())?;
        if server.get_operation_status(&target.operation_id)? != OperationStatus::InProgress {
            return Ok(());
        }
        executor::record_failure(&ctx, &target, &message)
    })
    .await
    .map_err(OperationError::from)
    .and_then(|recorded| recorded);

    if let Err(e) = result {
        error!(operation_id = %dispatch.operation_id, error = %e, "Failed to record operation failure");
    }
}
