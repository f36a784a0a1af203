use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A job or output record: a flat JSON object.
pub type Record = Map<String, Value>;

/// Where an operation runs: against one Barman server, or the whole instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Server(String),
    Instance,
}

impl Scope {
    pub fn from_server_name(name: Option<&str>) -> Self {
        match name {
            Some(name) => Self::Server(name.to_string()),
            None => Self::Instance,
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        match self {
            Self::Server(name) => Some(name),
            Self::Instance => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(name) => write!(f, "server '{}'", name),
            Self::Instance => f.write_str("instance operation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    InProgress,
    Done,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an operation listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
}
