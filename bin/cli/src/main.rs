//! `klikkflow` command-line runner.
//!
//! Runs workflow definitions from JSON files against a file-backed
//! repository, so failed or interrupted runs can be resumed later.

mod error;

use clap::{Parser, Subcommand};
use error::CliError;
use klikkflow_core::{ExecutionId, Result};
use klikkflow_workflow::{
    CancellationFlag, Engine, EngineConfig, ExecutionContext, ExecutionMode, ExecutionRepository,
    ExecutionStatus, FileRepository, LogSink, NodeId, WorkflowDefinition, WorkflowError,
};
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "klikkflow")]
#[command(about = "Run klikkflow workflow definitions", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding stored workflows and executions
    #[arg(long, global = true, default_value = ".klikkflow")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition without running it
    Validate {
        /// Path to the workflow JSON file
        file: PathBuf,
    },
    /// Run a workflow definition
    Run {
        /// Path to the workflow JSON file
        file: PathBuf,
        /// Trigger data as inline JSON
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Trigger data read from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,
    },
    /// Resume an interrupted or failed execution from its checkpoint
    Resume {
        /// Execution ID
        execution_id: String,
    },
    /// Re-run a node and everything downstream of it
    Retry {
        /// Execution ID
        execution_id: String,
        /// Node to restart from
        #[arg(short, long)]
        node: String,
    },
    /// Print a stored execution
    Show {
        /// Execution ID
        execution_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(Some(context)) if context.status != ExecutionStatus::Success => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(report) => {
            tracing::error!(error = %report.current_context(), "command failed");
            eprintln!("error: {}", report.current_context());
            ExitCode::FAILURE
        }
    }
}

/// Runs a command, returning the execution it produced or inspected.
async fn execute(cli: Cli) -> Result<Option<ExecutionContext>, CliError> {
    let config = EngineConfig::load(cli.config.as_deref()).map_err(|e| CliError::Config {
        details: e.to_string(),
    })?;
    let repository = Arc::new(FileRepository::new(&cli.data_dir));
    let engine = Engine::new()
        .with_config(config)
        .with_repository(repository.clone())
        .with_events(Arc::new(LogSink));

    let context = match cli.command {
        Commands::Validate { file } => {
            let definition = read_definition(&file).await?;
            engine
                .validate(&definition)
                .map_err(|report| engine_error(&report))?;
            println!("{} is valid ({} nodes)", file.display(), definition.nodes.len());
            return Ok(None);
        }
        Commands::Run {
            file,
            input,
            input_file,
        } => {
            let definition = read_definition(&file).await?;
            let trigger_data = match (input, input_file) {
                (Some(inline), _) => parse_json(&inline, "--input")?,
                (None, Some(path)) => read_json(&path).await?,
                (None, None) => JsonValue::Object(serde_json::Map::new()),
            };
            repository
                .save_workflow_definition(&definition)
                .await
                .map_err(|e| CliError::Repository {
                    details: e.to_string(),
                })?;
            engine
                .run_with(&definition, trigger_data, ExecutionMode::Manual, interrupt_flag())
                .await
                .map_err(|report| engine_error(&report))?
        }
        Commands::Resume { execution_id } => {
            let (definition, checkpoint) = load_execution(repository.as_ref(), &execution_id).await?;
            engine
                .resume_with(&definition, checkpoint, interrupt_flag())
                .await
                .map_err(|report| engine_error(&report))?
        }
        Commands::Retry { execution_id, node } => {
            let (definition, checkpoint) = load_execution(repository.as_ref(), &execution_id).await?;
            engine
                .retry_from(&definition, checkpoint, &NodeId::new(node))
                .await
                .map_err(|report| engine_error(&report))?
        }
        Commands::Show { execution_id } => {
            let (_, context) = load_execution(repository.as_ref(), &execution_id).await?;
            context
        }
    };

    print_context(&context)?;
    Ok(Some(context))
}

/// A flag raised by Ctrl-C.
fn interrupt_flag() -> CancellationFlag {
    let flag = CancellationFlag::new();
    let raised = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling execution");
            raised.cancel();
        }
    });
    flag
}

fn engine_error(report: &Report<WorkflowError>) -> CliError {
    CliError::Engine {
        details: report.current_context().to_string(),
    }
}

fn print_context(context: &ExecutionContext) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(context).map_err(|e| CliError::InvalidJson {
        origin: "execution".to_string(),
        details: e.to_string(),
    })?;
    println!("{rendered}");
    Ok(())
}

async fn load_execution(
    repository: &dyn ExecutionRepository,
    execution_id: &str,
) -> Result<(WorkflowDefinition, ExecutionContext), CliError> {
    let id = execution_id
        .parse::<ExecutionId>()
        .map_err(|e| CliError::InvalidId {
            value: execution_id.to_string(),
            details: e.to_string(),
        })?;
    let context = repository
        .load_execution_state(id)
        .await
        .map_err(|e| CliError::Repository {
            details: e.to_string(),
        })?;
    let definition = repository
        .load_workflow_definition(context.workflow_id)
        .await
        .map_err(|e| CliError::Repository {
            details: e.to_string(),
        })?;
    Ok((definition, context))
}

async fn read_definition(path: &Path) -> Result<WorkflowDefinition, CliError> {
    let value = read_json(path).await?;
    let definition = serde_json::from_value(value).map_err(|e| CliError::InvalidJson {
        origin: path.display().to_string(),
        details: e.to_string(),
    })?;
    Ok(definition)
}

async fn read_json(path: &Path) -> Result<JsonValue, CliError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::ReadFile {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
    parse_json(&content, &path.display().to_string())
}

fn parse_json(content: &str, source: &str) -> Result<JsonValue, CliError> {
    let value = serde_json::from_str(content).map_err(|e| CliError::InvalidJson {
        origin: source.to_string(),
        details: e.to_string(),
    })?;
    Ok(value)
}
