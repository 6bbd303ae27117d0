use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use propload_loader::LoadConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "propload")]
#[command(about = "Load property listing JSON into the relational store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate and load every record of the input file.
    Load {
        /// Overrides JSON_PATH.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Create the schema if it does not exist yet.
    Migrate,
    /// Check the input against the record model without a database.
    Validate {
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let mut config = LoadConfig::from_env();
    debug!(config = ?config, "resolved load config");

    match cli.command.unwrap_or(Commands::Load { input: None }) {
        Commands::Load { input } => {
            if let Some(path) = input {
                config.json_path = path;
            }
            let summary = propload_loader::run_load(&config).await?;
            println!(
                "load complete: run_id={} records={} inserted={} skipped={} rejected={} report={}",
                summary.run_id,
                summary.records_total,
                summary.inserted,
                summary.skipped,
                summary.rejected,
                summary.report_path
            );
        }
        Commands::Migrate => {
            let statements = propload_loader::run_migrate(&config).await?;
            println!(
                "schema ensured: statements={} path={}",
                statements,
                config.schema_path.display()
            );
        }
        Commands::Validate { input } => {
            let path = input.unwrap_or_else(|| config.json_path.clone());
            let summary = propload_loader::validate_file(&path).await?;
            println!(
                "validation complete: input={} records={} valid={} rejected={}",
                summary.input_path,
                summary.records_total,
                summary.valid,
                summary.rejected.len()
            );
        }
    }

    Ok(())
}
