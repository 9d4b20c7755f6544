//! shokuyoku CLI - Kafka event ingestion worker.

use anyhow::Result;
use clap::{Parser, Subcommand};
use shokuyoku_core::config::{LogFormat, LogLevel};
use shokuyoku_core::frame::ByteOrder;
use shokuyoku_core::{Config, Error as CoreError};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// 0 is success, 1-127 are application errors. A worker stopped by SIGINT
/// or SIGTERM exits 0 after its final flush.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing variables)
    ConfigError = 1,
    /// Kafka error (connection, consumer group, commit)
    StreamError = 2,
    /// Schema registry error
    SchemaError = 3,
    /// Storage error (S3, filesystem)
    StorageError = 4,
    /// Input could not be decoded
    DecodeError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code, preferring the core error variant and
    /// falling back to the message text.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(core) = error.downcast_ref::<CoreError>() {
            return match core {
                CoreError::Config(_) | CoreError::MissingConfig(_) => ExitCode::ConfigError,
                CoreError::Stream(_) => ExitCode::StreamError,
                CoreError::Schema(_) => ExitCode::SchemaError,
                CoreError::Storage(_) | CoreError::Buffer(_) => ExitCode::StorageError,
                CoreError::Frame(_) | CoreError::Payload(_) => ExitCode::DecodeError,
                _ => ExitCode::RuntimeError,
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("kafka") || error_str.contains("consumer") {
            ExitCode::StreamError
        } else if error_str.contains("storage") || error_str.contains("s3") {
            ExitCode::StorageError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "shokuyoku")]
#[command(about = "Kafka event ingestion into Parquet on object storage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (environment variables are used when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion worker
    Worker {
        /// Override Kafka bootstrap servers
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override Kafka topic
        #[arg(long)]
        topic: Option<String>,

        /// Override consumer group
        #[arg(long)]
        consumer_group: Option<String>,
    },

    /// Validate configuration without starting the worker
    Validate,

    /// Decode a raw frame file and print its flattened record
    Decode {
        /// File holding one raw message
        file: PathBuf,

        /// Byte order of the length fields (big or little)
        #[arg(long, default_value = "big")]
        endian: String,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    let (log_format, log_level) = logging_settings(&cli.config);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(level_directive(&log_level)),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
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
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Log settings are read before the full configuration is validated, so a
/// broken configuration can still be reported in the right format.
fn logging_settings(path: &Option<PathBuf>) -> (LogFormat, LogLevel) {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .ok()
            .and_then(|content| toml::from_str::<Config>(&content).ok())
            .map(|config| (config.monitoring.log_format, config.monitoring.log_level))
            .unwrap_or_default(),
        None => {
            let format = match std::env::var("LOG_FORMAT").as_deref() {
                Ok("text") => LogFormat::Text,
                _ => LogFormat::Json,
            };
            (format, LogLevel::default())
        }
    }
}

fn level_directive(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Worker {
            bootstrap_servers,
            topic,
            consumer_group,
        } => {
            let config = load_config(&cli.config)?;
            commands::worker::run(config, bootstrap_servers, topic, consumer_group).await?;
        }

        Commands::Validate => {
            commands::validate::run(&cli.config)?;
        }

        Commands::Decode { file, endian } => {
            let order: ByteOrder = endian.parse()?;
            commands::decode::run(&file, order)?;
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}
