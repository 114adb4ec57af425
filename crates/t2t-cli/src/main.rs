//! t2t CLI - topic-to-topic stream transformation tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use t2t_core::config::LogFormat;
use t2t_core::{Config, ErrorKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Broker unreachable, metadata or consumer failure
    ConnectionError = 2,
    /// Output records could not be published within the retry budget
    PublishError = 3,
    /// Checkpoint store could not persist or read offsets
    CheckpointError = 4,
    /// Transform rejected a record under the fail policy
    TransformError = 5,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by its engine error class.
    fn from_error(error: &anyhow::Error) -> Self {
        let kind = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<t2t_core::Error>())
            .map(|e| e.kind());

        match kind {
            Some(ErrorKind::Config) => ExitCode::ConfigError,
            Some(ErrorKind::Connection) => ExitCode::ConnectionError,
            Some(ErrorKind::Publish) => ExitCode::PublishError,
            Some(ErrorKind::Checkpoint) => ExitCode::CheckpointError,
            Some(ErrorKind::Transform) => ExitCode::TransformError,
            Some(ErrorKind::Other) | None => ExitCode::RuntimeError,
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "t2t")]
#[command(about = "Topic-to-topic stream transformation CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stream engine until interrupted
    Run(commands::run::RunArgs),

    /// Show status and health of a running engine
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Print committed offsets from the local checkpoint store
    Checkpoints {
        /// Consumer group to inspect (defaults to the configured group)
        #[arg(long)]
        group_id: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config when it parses; errors surface later.
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map_or("info", |m| m.log_level.as_directive()),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.map_or(LogFormat::Json, |m| m.log_format) {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => {
            let config = load_config(&cli.config)?;
            return commands::run::run(config, args).await;
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Checkpoints { group_id } => {
            let config = load_config(&cli.config)?;
            commands::checkpoints::run(&config, group_id.as_deref())?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config.validate()?;
            println!("Configuration is valid");
            println!("  input topic:  {}", config.stream.input_topic);
            println!("  output topic: {}", config.stream.output_topic);
            println!("  group:        {}", config.stream.group_id);
        }
    }

    Ok(ExitCode::Success)
}

/// Read and parse the config file without validating it.
///
/// Validation runs after CLI overrides are applied.
fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));

    let content = std::fs::read_to_string(&path).map_err(|e| {
        t2t_core::Error::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| t2t_core::Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(config)
}
