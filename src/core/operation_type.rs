//! The closed set of operation types and what each one requires.
//!
//! Every type knows which job keys it needs, how to validate them, and how to
//! turn a job record into the argument list of the external `barman` command.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::models::{Record, Scope};
use crate::error::{OperationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Recovery,
    ConfigSwitch,
    ConfigUpdate,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [Self::Recovery, Self::ConfigSwitch, Self::ConfigUpdate];

    /// Value stored as `operation_type` in job records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::ConfigSwitch => "config_switch",
            Self::ConfigUpdate => "config_update",
        }
    }

    /// CLI subcommand a detached worker runs for this type.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::ConfigSwitch => "config-switch",
            Self::ConfigUpdate => "config-update",
        }
    }

    /// `barman` subcommand executed for this type.
    pub fn barman_subcommand(&self) -> &'static str {
        match self {
            Self::Recovery => "recover",
            Self::ConfigSwitch => "config-switch",
            Self::ConfigUpdate => "config-update",
        }
    }

    /// Whether the type targets a single server (as opposed to the instance).
    pub fn is_server_scoped(&self) -> bool {
        match self {
            Self::Recovery | Self::ConfigSwitch => true,
            Self::ConfigUpdate => false,
        }
    }

    pub fn supports(&self, scope: &Scope) -> bool {
        self.is_server_scoped() == matches!(scope, Scope::Server(_))
    }

    pub fn check_scope(&self, scope: &Scope) -> Result<()> {
        if self.supports(scope) {
            Ok(())
        } else {
            Err(OperationError::UnsupportedScope {
                op_type: self.as_str().to_string(),
                scope: scope.to_string(),
            })
        }
    }

    /// Keys that must be present in the job record.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Recovery => &["backup_id", "destination_directory", "remote_ssh_command"],
            Self::ConfigSwitch => &[],
            Self::ConfigUpdate => &["changes"],
        }
    }

    /// Check type-specific content of a job record.
    pub fn validate(&self, content: &Record) -> Result<()> {
        let mut missing: Vec<&str> = self
            .required_keys()
            .iter()
            .copied()
            .filter(|key| !content.contains_key(*key))
            .collect();
        missing.sort_unstable();

        if !missing.is_empty() {
            return Err(OperationError::MalformedContent(format!(
                "Missing required arguments: {}",
                missing.join(", ")
            )));
        }

        match self {
            Self::Recovery => require_strings(content, self.required_keys()),
            Self::ConfigSwitch => validate_config_switch(content),
            Self::ConfigUpdate => Ok(()),
        }
    }

    /// Arguments passed to `barman` (after the subcommand) for a job.
    pub fn command_args(&self, scope: &Scope, content: &Record) -> Result<Vec<String>> {
        self.check_scope(scope)?;
        self.validate(content)?;

        let mut args = vec![self.barman_subcommand().to_string()];

        match self {
            Self::Recovery => {
                args.push(server_name(scope));
                args.push(string_value(content, "backup_id"));
                args.push(string_value(content, "destination_directory"));
                args.push("--remote-ssh-command".to_string());
                args.push(string_value(content, "remote_ssh_command"));
            }
            Self::ConfigSwitch => {
                args.push(server_name(scope));
                if content.contains_key("model_name") {
                    args.push(string_value(content, "model_name"));
                } else {
                    args.push("--reset".to_string());
                }
            }
            Self::ConfigUpdate => {
                let changes = content.get("changes").unwrap_or(&Value::Null);
                args.push(changes.to_string());
            }
        }

        Ok(args)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                OperationError::MalformedContent(format!("Invalid operation type '{}'", s))
            })
    }
}

fn validate_config_switch(content: &Record) -> Result<()> {
    match (content.get("model_name"), content.get("reset")) {
        (Some(_), Some(_)) => Err(OperationError::MalformedContent(
            "Arguments 'model_name' and 'reset' are mutually exclusive".to_string(),
        )),
        (None, None) => Err(OperationError::MalformedContent(
            "One among the following arguments must be specified: model_name, reset".to_string(),
        )),
        (Some(_), None) => require_strings(content, &["model_name"]),
        (None, Some(Value::Bool(true))) => Ok(()),
        (None, Some(_)) => Err(OperationError::MalformedContent(
            "Value of 'reset' key, if present, can only be 'true'".to_string(),
        )),
    }
}

fn require_strings(content: &Record, keys: &[&str]) -> Result<()> {
    let mut invalid: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|key| !matches!(content.get(*key), Some(Value::String(_))))
        .collect();
    invalid.sort_unstable();

    if invalid.is_empty() {
        Ok(())
    } else {
        Err(OperationError::MalformedContent(format!(
            "Invalid value type for arguments: {}",
            invalid.join(", ")
        )))
    }
}

// Only called after validation, so the key holds a string.
fn string_value(content: &Record, key: &str) -> String {
    content
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn server_name(scope: &Scope) -> String {
    scope.server_name().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn malformed_message(result: Result<()>) -> String {
        match result {
            Err(OperationError::MalformedContent(msg)) => msg,
            other => panic!("expected MalformedContent, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_missing_keys_are_sorted() {
        let cases = [
            (
                json!({}),
                "backup_id, destination_directory, remote_ssh_command",
            ),
            (
                json!({"remote_ssh_command": "ssh pg"}),
                "backup_id, destination_directory",
            ),
            (
                json!({"destination_directory": "/tmp/x"}),
                "backup_id, remote_ssh_command",
            ),
            (
                json!({"backup_id": "latest", "destination_directory": "/tmp/x"}),
                "remote_ssh_command",
            ),
        ];

        for (content, missing) in cases {
            let msg = malformed_message(OperationType::Recovery.validate(&record(content)));
            assert_eq!(msg, format!("Missing required arguments: {}", missing));
        }
    }

    #[test]
    fn test_recovery_rejects_non_string_values() {
        let content = record(json!({
            "backup_id": 42,
            "destination_directory": "/tmp/x",
            "remote_ssh_command": ["ssh"],
        }));

        let msg = malformed_message(OperationType::Recovery.validate(&content));
        assert_eq!(
            msg,
            "Invalid value type for arguments: backup_id, remote_ssh_command"
        );
    }

    #[test]
    fn test_config_switch_rules() {
        let both = record(json!({"model_name": "m", "reset": true}));
        let msg = malformed_message(OperationType::ConfigSwitch.validate(&both));
        assert!(msg.contains("model_name"));
        assert!(msg.contains("reset"));
        assert!(msg.contains("mutually exclusive"));

        let neither = record(json!({}));
        let msg = malformed_message(OperationType::ConfigSwitch.validate(&neither));
        assert_eq!(
            msg,
            "One among the following arguments must be specified: model_name, reset"
        );

        let reset_false = record(json!({"reset": false}));
        let msg = malformed_message(OperationType::ConfigSwitch.validate(&reset_false));
        assert_eq!(msg, "Value of 'reset' key, if present, can only be 'true'");

        assert!(OperationType::ConfigSwitch
            .validate(&record(json!({"model_name": "m"})))
            .is_ok());
        assert!(OperationType::ConfigSwitch
            .validate(&record(json!({"reset": true})))
            .is_ok());
    }

    #[test]
    fn test_config_update_requires_changes() {
        let msg = malformed_message(OperationType::ConfigUpdate.validate(&record(json!({}))));
        assert_eq!(msg, "Missing required arguments: changes");
    }

    #[test]
    fn test_recovery_command_args() {
        let content = record(json!({
            "backup_id": "20240101T000000",
            "destination_directory": "/restore",
            "remote_ssh_command": "ssh postgres@db",
        }));
        let scope = Scope::Server("pg".to_string());

        let args = OperationType::Recovery.command_args(&scope, &content).unwrap();
        assert_eq!(
            args,
            vec![
                "recover",
                "pg",
                "20240101T000000",
                "/restore",
                "--remote-ssh-command",
                "ssh postgres@db",
            ]
        );
    }

    #[test]
    fn test_config_switch_command_args() {
        let scope = Scope::Server("pg".to_string());

        let args = OperationType::ConfigSwitch
            .command_args(&scope, &record(json!({"model_name": "pg:primary"})))
            .unwrap();
        assert_eq!(args, vec!["config-switch", "pg", "pg:primary"]);

        let args = OperationType::ConfigSwitch
            .command_args(&scope, &record(json!({"reset": true})))
            .unwrap();
        assert_eq!(args, vec!["config-switch", "pg", "--reset"]);
    }

    #[test]
    fn test_config_update_serializes_changes() {
        let content = record(json!({"changes": [{"scope": "server", "server_name": "pg"}]}));

        let args = OperationType::ConfigUpdate
            .command_args(&Scope::Instance, &content)
            .unwrap();
        assert_eq!(
            args,
            vec![
                "config-update".to_string(),
                r#"[{"scope":"server","server_name":"pg"}]"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_scope_rules() {
        let server = Scope::Server("pg".to_string());
        assert!(OperationType::Recovery.supports(&server));
        assert!(!OperationType::Recovery.supports(&Scope::Instance));
        assert!(OperationType::ConfigUpdate.supports(&Scope::Instance));

        let err = OperationType::ConfigUpdate.check_scope(&server).unwrap_err();
        assert!(matches!(err, OperationError::UnsupportedScope { .. }));
    }

    #[test]
    fn test_parse_type() {
        assert_eq!(
            "config_switch".parse::<OperationType>().unwrap(),
            OperationType::ConfigSwitch
        );
        assert!("backup".parse::<OperationType>().is_err());
    }
}
