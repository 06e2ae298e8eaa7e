use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forgeflow::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(version, about = "Run parallel coding agents over a GitHub epic")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute every open child issue of an epic
    Run {
        /// Epic issue number
        epic: String,
        /// Print events as JSON lines instead of progress text
        #[arg(long)]
        json: bool,
    },
    /// List execution patterns and the labels that select them
    Patterns,
    /// List worker types and their capabilities
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { epic, json } => cmd::cmd_run(project_dir, epic, *json).await?,
        Commands::Patterns => cmd::cmd_patterns(&project_dir)?,
        Commands::Agents => cmd::cmd_agents(),
    }

    Ok(())
}
