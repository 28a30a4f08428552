//! CLI entry-point for writing a synthetic imputed cohort.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::{info, instrument};

use crate::{
    config::Settings,
    data::{
        io::{self, CASEID_COLUMN, IMPUTATION_COLUMN},
        simulate::{simulate_cohort, SimulationConfig},
    },
};

/// Args for the `simulate` command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// Records per imputation.
    #[arg(long, default_value_t = 3500)]
    pub n: usize,
    /// Number of imputed datasets.
    #[arg(long, default_value_t = 10)]
    pub imputations: usize,
    /// Seed; defaults to RWE_SEED.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Share of records with a missing (re-imputed) covariate.
    #[arg(long, default_value_t = 0.2)]
    pub missing_rate: f64,
    /// Output table (.csv or .parquet); defaults to DATA_DIR/cohort_long.parquet.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[instrument(skip(settings))]
pub async fn run(args: Args, settings: Settings) -> Result<()> {
    let config = SimulationConfig {
        n: args.n,
        imputations: args.imputations,
        seed: args.seed.unwrap_or(settings.seed),
        missing_rate: args.missing_rate,
    };
    let out = args
        .out
        .unwrap_or_else(|| settings.join_data("cohort_long.parquet"));

    let written = out.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let datasets = simulate_cohort(&config).context("simulating cohort")?;
        let mut frame = io::to_long_frame(&datasets, CASEID_COLUMN, IMPUTATION_COLUMN)?;
        io::write_frame(&mut frame, &out)
            .with_context(|| format!("writing {}", out.display()))?;
        Ok(())
    })
    .await??;

    info!(path = %written.display(), "simulated cohort written");
    Ok(())
}
