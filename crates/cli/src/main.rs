use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use helios_cli::report;
use helios_cli::setup::{self, Overrides};
use helios_core::config::{self, AppConfig};
use helios_core::{Collaborators, Pipeline, RunStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            root,
            json,
            exclude,
            include_hidden,
            metrics_port,
            database,
            shutdown_timeout_secs,
        } => {
            let overrides = Overrides {
                exclude,
                include_hidden,
                metrics_port,
                database,
            };
            run(cfg, root, &overrides, json, Duration::from_secs(shutdown_timeout_secs)).await
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(name = "helios")]
#[command(about = "Discover files and produce categorization suggestions", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a directory tree
    Run {
        /// Directory to scan
        root: PathBuf,
        /// Output the completion report as JSON
        #[arg(long)]
        json: bool,
        /// Extra exclude glob (repeatable)
        #[arg(long, value_name = "GLOB")]
        exclude: Vec<String>,
        /// Descend into hidden files and directories
        #[arg(long, default_value_t = false)]
        include_hidden: bool,
        /// Serve metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
        /// SQLite database for suggestions
        #[arg(long)]
        database: Option<String>,
        /// Seconds to wait for workers before force-stopping them
        #[arg(long, default_value_t = 30)]
        shutdown_timeout_secs: u64,
    },
    /// Print the effective configuration as JSON
    Config,
}

async fn run(
    mut cfg: AppConfig,
    root: PathBuf,
    overrides: &Overrides,
    json: bool,
    shutdown_timeout: Duration,
) -> Result<()> {
    setup::apply_overrides(&mut cfg, overrides);
    let sink = setup::build_sink(&cfg).await?;
    let collaborators = Collaborators::from_config(&cfg, &setup::runtime_registry(&cfg), sink)?;
    let pipeline = Pipeline::start(root, cfg, collaborators).await?;

    tokio::select! {
        _ = pipeline.await_completion() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => warn!("interrupt received, shutting down"),
            Err(err) => {
                warn!(error = %err, "cannot listen for interrupts");
                pipeline.await_completion().await;
            }
        },
    }
    let report = pipeline.shutdown(shutdown_timeout).await;

    if json {
        println!("{}", report::render_json(&report)?);
    } else {
        print!("{}", report::render_text(&report));
    }
    if report.status == RunStatus::AllWorkersFailed {
        bail!("every worker slot failed permanently");
    }
    Ok(())
}
