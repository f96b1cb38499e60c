use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

mod commands;
mod config;
mod manager;
mod proxy;
mod sandbox;
mod server;
mod store;
#[cfg(test)]
mod testing;

use config::Config;

#[derive(Parser)]
#[command(name = "lnfly-backend")]
#[command(
    author,
    version,
    about = "Run generated app backends in sandboxed runtime processes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormat,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Config file (defaults to lnfly.toml in the current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend API and app proxy server
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Show recorded backend state
    Status {
        /// Only show this app
        app_id: Option<String>,
    },

    /// Register an app or update its backend code
    Register {
        app_id: String,

        /// Backend source file
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Wallet connection URL for this app
        #[arg(short, long)]
        wallet_url: Option<String>,
    },

    /// Delete an app's backend storage file
    ClearStorage { app_id: String },
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("lnfly_backend=debug,tower_http=debug")
        } else {
            EnvFilter::new("lnfly_backend=info")
        }
    });

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match cli.log_format {
        LogFormat::Pretty => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    });

    let guard = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "lnfly-backend.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().json().with_writer(writer).with_ansi(false).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).with(filter).init();
    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)?
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { bind } => {
            commands::serve::run(config, bind).await?;
        }
        Commands::Status { app_id } => {
            commands::status::run(&config, app_id).await?;
        }
        Commands::Register {
            app_id,
            source,
            wallet_url,
        } => {
            commands::register::run(&config, app_id, source, wallet_url).await?;
        }
        Commands::ClearStorage { app_id } => {
            commands::clear_storage::run(&config, app_id).await?;
        }
    }

    Ok(())
}
