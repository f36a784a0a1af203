//! Route handlers. Server and instance routes share the same logic, only the
//! scope differs.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use super::WebState;
use super::error::ApiError;
use crate::core::diagnose::diagnose as run_diagnose;
use crate::core::operation::validate_id;
use crate::core::{
    BackupCatalog, Dispatch, Operation, OperationServer, OperationType, Record, Scope, executor,
};
use crate::error::OperationError;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub op_type: Option<String>,
    pub verbose: Option<String>,
}

impl ListQuery {
    fn verbose(&self) -> bool {
        self.verbose
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

pub async fn status() -> &'static str {
    "OK"
}

pub async fn diagnose(State(state): State<WebState>) -> Result<Json<Value>, ApiError> {
    let output = run_diagnose(&state.ctx.config.barman_command).await?;
    Ok(Json(output))
}

pub async fn list_server_operations(
    State(state): State<WebState>,
    Path(server_name): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    blocking(move || list_operations(&state, Scope::Server(server_name), &query)).await
}

pub async fn list_instance_operations(
    State(state): State<WebState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    blocking(move || list_operations(&state, Scope::Instance, &query)).await
}

pub async fn create_server_operation(
    State(state): State<WebState>,
    Path(server_name): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(body) = payload?;
    blocking(move || create_operation(&state, Scope::Server(server_name), body)).await
}

pub async fn create_instance_operation(
    State(state): State<WebState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(body) = payload?;
    blocking(move || create_operation(&state, Scope::Instance, body)).await
}

pub async fn get_server_operation(
    State(state): State<WebState>,
    Path((server_name, operation_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    blocking(move || get_operation(&state, Scope::Server(server_name), &operation_id)).await
}

pub async fn get_instance_operation(
    State(state): State<WebState>,
    Path(operation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    blocking(move || get_operation(&state, Scope::Instance, &operation_id)).await
}

/// Run record store work on the blocking thread pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::from(OperationError::from(e)))?
}

fn list_operations(state: &WebState, scope: Scope, query: &ListQuery) -> Result<Json<Value>, ApiError> {
    let type_filter = query
        .op_type
        .as_deref()
        .map(str::parse::<OperationType>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let server = OperationServer::resolve(&state.ctx.config, scope)?;
    let operations = server.list_operations(type_filter)?;

    if query.verbose() {
        Ok(Json(json!({ "operations": operations })))
    } else {
        let ids: Vec<String> = operations.into_iter().map(|op| op.id).collect();
        Ok(Json(json!({ "operations": ids })))
    }
}

fn get_operation(state: &WebState, scope: Scope, operation_id: &str) -> Result<Json<Value>, ApiError> {
    let server = OperationServer::resolve(&state.ctx.config, scope)?;

    // An ID that could never have been stored cannot exist.
    validate_id(operation_id).map_err(|_| ApiError::not_found())?;

    let status = server.get_operation_status(operation_id)?;
    Ok(Json(json!({
        "operation_id": operation_id,
        "status": status,
    })))
}

fn create_operation(
    state: &WebState,
    scope: Scope,
    body: Value,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Value::Object(mut content) = body else {
        return Err(ApiError::bad_request("Request body must be a JSON object"));
    };

    if content.is_empty() {
        return Err(ApiError::bad_request(format!(
            "Minimum barman options not met for {}",
            scope
        )));
    }

    let op_type = requested_type(&content, &scope)?;
    let operation_id = match content.remove("operation_id") {
        None => None,
        Some(Value::String(id)) => Some(id),
        Some(_) => return Err(ApiError::bad_request("Invalid value type for 'operation_id'")),
    };

    let config = &state.ctx.config;
    let operation = Operation::create(config, scope, op_type, operation_id)?;

    if op_type == OperationType::Recovery {
        resolve_backup_id(state, &operation, &mut content)?;
    }

    operation.write_job_file(content)?;

    let dispatch = Dispatch::new(&operation);
    if let Err(e) = state.pool.submit(dispatch.clone()) {
        let message = format!("Operation could not be scheduled: {}", e);
        if let Err(record_err) = executor::record_failure(&state.ctx, &dispatch, &message) {
            error!(operation_id = %dispatch.operation_id, error = %record_err, "Failed to record unscheduled operation");
        }
        return Err(e.into());
    }

    info!(
        operation_id = %operation.id(),
        scope = %operation.scope(),
        operation_type = %op_type,
        "Operation accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "operation_id": operation.id() })),
    ))
}

/// Operation type named by the request, or the default for the scope.
fn requested_type(content: &Record, scope: &Scope) -> Result<OperationType, ApiError> {
    match content.get("type") {
        None => Ok(match scope {
            Scope::Server(_) => OperationType::Recovery,
            Scope::Instance => OperationType::ConfigUpdate,
        }),
        Some(Value::String(name)) => name
            .parse()
            .map_err(|e: OperationError| ApiError::bad_request(e.to_string())),
        Some(other) => Err(ApiError::bad_request(format!(
            "Invalid operation type '{}'",
            other
        ))),
    }
}

/// Replace a symbolic `backup_id` with the concrete backup it points to.
fn resolve_backup_id(
    state: &WebState,
    operation: &Operation,
    content: &mut Record,
) -> Result<(), ApiError> {
    let requested = match content.get("backup_id") {
        None => return Err(ApiError::bad_request("Request body is missing 'backup_id'")),
        Some(Value::String(id)) => id.clone(),
        // Left for validation to report.
        Some(_) => return Ok(()),
    };

    let server_name = operation.scope().server_name().unwrap_or_default();
    let catalog = BackupCatalog::for_server(&state.ctx.config, server_name)?;
    let resolved = catalog.resolve(&requested)?;

    content.insert("backup_id".to_string(), resolved.into());
    Ok(())
}
