use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pg_backup_api::config::{self, LaunchMode};
use pg_backup_api::context::AppContext;
use pg_backup_api::core::executor::{self, Dispatch};
use pg_backup_api::core::operation::validate_id;
use pg_backup_api::core::{OperationServer, OperationType, Scope, WorkerPool};
use pg_backup_api::logging::{self, LogConfig};
use pg_backup_api::web::WebServer;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const UNAVAILABLE_MESSAGE: &str = "The Postgres Backup API does not appear to be available.";

#[derive(Parser)]
#[command(name = "pg-backup-api")]
#[command(about = "Postgres Backup API: REST interface for Barman", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve(ServeArgs),
    /// Check if the REST API server is up and running
    Status(StatusArgs),
    /// Run a recovery operation registered by the API
    Recovery(ServerOperationArgs),
    /// Run a config-switch operation registered by the API
    ConfigSwitch(ServerOperationArgs),
    /// Run a config-update operation registered by the API
    ConfigUpdate(InstanceOperationArgs),
    /// Mark an in-progress operation as failed
    Abandon(AbandonArgs),
    /// List operations without going through the API server
    ListOperations(ListOperationsArgs),
    /// Show the status of an operation without going through the API server
    GetOperation(GetOperationArgs),
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    launch_mode: Option<LaunchMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    barman_home: Option<PathBuf>,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args)]
struct ServerOperationArgs {
    #[arg(long)]
    server_name: String,

    #[arg(long)]
    operation_id: String,
}

#[derive(Args)]
struct InstanceOperationArgs {
    #[arg(long)]
    operation_id: String,
}

#[derive(Args)]
struct AbandonArgs {
    /// Omit for instance operations
    #[arg(long)]
    server_name: Option<String>,

    #[arg(long)]
    operation_id: String,

    #[arg(long, default_value = "Operation abandoned by the administrator")]
    reason: String,
}

#[derive(Args)]
struct ListOperationsArgs {
    /// Omit for instance operations
    #[arg(long)]
    server_name: Option<String>,

    /// Only list operations of this type
    #[arg(long = "type", value_name = "TYPE")]
    op_type: Option<String>,
}

#[derive(Args)]
struct GetOperationArgs {
    /// Omit for instance operations
    #[arg(long)]
    server_name: Option<String>,

    #[arg(long)]
    operation_id: String,
}

/// Global flags that feed the configuration.
#[derive(Serialize)]
struct GlobalOverrides<'a> {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    verbose: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    json_logs: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    serve: Option<&'a ServeArgs>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let overrides = GlobalOverrides {
        verbose: cli.verbose,
        json_logs: cli.json_logs,
        serve: match &cli.command {
            Commands::Serve(args) => Some(args),
            _ => None,
        },
    };
    let config = config::AppConfig::new(cli.config.as_deref(), Some(&overrides))?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        file: config.log_file.clone(),
    })?;

    let ctx = AppContext::new(config, cli.config.clone());

    match cli.command {
        Commands::Serve(_) => {
            run_server(ctx).await.context("Failed to run the API server")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status(args) => run_status(&ctx, args.port).await,
        Commands::Recovery(args) => {
            let scope = Scope::Server(args.server_name);
            run_operation(&ctx, scope, OperationType::Recovery, args.operation_id).await
        }
        Commands::ConfigSwitch(args) => {
            let scope = Scope::Server(args.server_name);
            run_operation(&ctx, scope, OperationType::ConfigSwitch, args.operation_id).await
        }
        Commands::ConfigUpdate(args) => {
            run_operation(&ctx, Scope::Instance, OperationType::ConfigUpdate, args.operation_id)
                .await
        }
        Commands::Abandon(args) => {
            let scope = Scope::from_server_name(args.server_name.as_deref());
            executor::abandon(&ctx, scope, &args.operation_id, &args.reason)
                .with_context(|| format!("Failed to abandon operation '{}'", args.operation_id))?;
            println!("Operation '{}' abandoned", args.operation_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::ListOperations(args) => run_list_operations(&ctx, args),
        Commands::GetOperation(args) => run_get_operation(&ctx, args),
    }
}

async fn run_server(ctx: AppContext) -> Result<()> {
    let pool = WorkerPool::start(ctx.clone());
    let server = Arc::new(WebServer::new(ctx, pool.clone()));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_server.shutdown();
    });

    let result = server.start().await;
    pool.shutdown().await;
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_status(ctx: &AppContext, port: Option<u16>) -> Result<ExitCode> {
    let port = port.unwrap_or(ctx.config.port);
    let url = format!("http://127.0.0.1:{}/status", port);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    let available = match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Status check failed");
            false
        }
    };

    if available {
        println!("OK");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", UNAVAILABLE_MESSAGE);
        Ok(ExitCode::FAILURE)
    }
}

/// Worker entry point: execute a registered operation and record its outcome.
async fn run_operation(
    ctx: &AppContext,
    scope: Scope,
    op_type: OperationType,
    operation_id: String,
) -> Result<ExitCode> {
    let dispatch = Dispatch {
        scope,
        op_type,
        operation_id,
    };

    let success = executor::execute(ctx, &dispatch)
        .await
        .with_context(|| format!("Failed to execute {}", dispatch))?;

    if success {
        Ok(ExitCode::SUCCESS)
    } else {
        bail!("{} did not succeed", dispatch)
    }
}

fn run_list_operations(ctx: &AppContext, args: ListOperationsArgs) -> Result<ExitCode> {
    let type_filter = args
        .op_type
        .as_deref()
        .map(str::parse::<OperationType>)
        .transpose()?;

    let scope = Scope::from_server_name(args.server_name.as_deref());
    let server = OperationServer::resolve(&ctx.config, scope)?;
    let operations = server.list_operations(type_filter)?;

    println!("{}", serde_json::to_string_pretty(&json!({ "operations": operations }))?);
    Ok(ExitCode::SUCCESS)
}

fn run_get_operation(ctx: &AppContext, args: GetOperationArgs) -> Result<ExitCode> {
    validate_id(&args.operation_id)?;

    let scope = Scope::from_server_name(args.server_name.as_deref());
    let server = OperationServer::resolve(&ctx.config, scope)?;
    let status = server.get_operation_status(&args.operation_id)?;

    let body = json!({ "operation_id": args.operation_id, "status": status });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(ExitCode::SUCCESS)
}
