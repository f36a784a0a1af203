pub mod backups;
pub mod command;
pub mod diagnose;
pub mod executor;
pub mod models;
pub mod operation;
pub mod operation_server;
pub mod operation_type;
pub mod worker;

pub use backups::{BackupCatalog, BackupInfo};
pub use command::RunOutcome;
pub use executor::Dispatch;
pub use models::{OperationStatus, OperationSummary, Record, Scope};
pub use operation::Operation;
pub use operation_server::OperationServer;
pub use operation_type::OperationType;
pub use worker::{DispatchError, WorkerPool};
