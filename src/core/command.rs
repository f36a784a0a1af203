//! Running external commands with combined output capture.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// What happened when an external command was run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Interleaved stdout and stderr.
    pub output: String,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RunOutcome {
    /// An outcome for a command that never got to run.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run `program` with `args` until it exits (or `timeout` elapses).
///
/// Both output streams are redirected into one anonymous file, so their
/// interleaving is preserved. Failing to start the process is reported as an
/// unsuccessful outcome rather than an error.
pub async fn run_captured(
    program: &Path,
    args: &[String],
    timeout: Option<Duration>,
) -> RunOutcome {
    match run_inner(program, args, timeout).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(program = %program.display(), error = %e, "Failed to run command");
            RunOutcome::failed(format!(
                "Failed to run '{}': {}",
                program.display(),
                e
            ))
        }
    }
}

async fn run_inner(
    program: &Path,
    args: &[String],
    timeout: Option<Duration>,
) -> std::io::Result<RunOutcome> {
    let mut capture = tempfile::tempfile()?;

    debug!(program = %program.display(), ?args, "Spawning command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(capture.try_clone()?))
        .stderr(Stdio::from(capture.try_clone()?))
        .kill_on_drop(true)
        .spawn()?;

    let (status, timed_out) = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                warn!(program = %program.display(), timeout_secs = limit.as_secs(), "Command timed out, killing it");
                child.kill().await?;
                (None, true)
            }
        },
        None => (Some(child.wait().await?), false),
    };

    let output = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        capture.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        capture.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    })
    .await
    .map_err(std::io::Error::other)??;

    let mut outcome = RunOutcome {
        output,
        exit_code: status.and_then(|s| s.code()),
        timed_out,
    };

    if let Some(limit) = timeout.filter(|_| timed_out) {
        if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
            outcome.output.push('\n');
        }
        outcome
            .output
            .push_str(&format!("Command timed out after {} seconds", limit.as_secs()));
    }

    Ok(outcome)
}
