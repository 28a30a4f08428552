//! Command-line interface wiring for rwe-causal.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Settings;

pub mod analyze;
pub mod pool;
pub mod simulate;

/// Top-level CLI definition.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Match, re-weight and pool treatment effects across imputed cohorts",
    long_about = None
)]
pub struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Parse CLI arguments from the environment.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Dispatch the selected sub-command.
    pub async fn dispatch(self, settings: Settings) -> Result<()> {
        match self.command {
            Commands::Simulate(args) => simulate::run(args, settings).await,
            Commands::Analyze(args) => analyze::run(args, settings).await,
            Commands::Pool(args) => pool::run(args).await,
        }
    }
}

/// Supported sub-commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a synthetic multiply-imputed cohort as a long table.
    Simulate(simulate::Args),
    /// Match or weight, rake, estimate and pool across imputations.
    Analyze(analyze::Args),
    /// Pool per-imputation estimates read from a CSV file.
    Pool(pool::Args),
}
