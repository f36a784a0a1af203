use std::path::Path;
use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OperationError, Result};

/// Run `barman diagnose` and return the JSON document it prints.
pub async fn diagnose(barman_command: &Path) -> Result<Value> {
    debug!(command = %barman_command.display(), "Running diagnose");

    let output = Command::new(barman_command)
        .arg("diagnose")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            OperationError::Diagnose(format!(
                "could not run '{}': {}",
                barman_command.display(),
                e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OperationError::Diagnose(format!(
            "'{} diagnose' exited with {}: {}",
            barman_command.display(),
            output.status,
            stderr.trim()
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| OperationError::Diagnose(format!("output is not valid JSON: {}", e)))
}
