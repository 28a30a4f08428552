//! CLI entry-point for pooling estimates with Rubin's rules.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::pooling::rubin::{pool_with, Estimate, PoolingOptions};

/// Args for the `pool` command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// CSV with `estimate` and `std_error` columns, one row per imputation.
    #[arg(long)]
    pub input: PathBuf,
    #[arg(long, default_value_t = 0.95)]
    pub conf_level: f64,
    /// Complete-data degrees of freedom.
    #[arg(long)]
    pub dfcom: Option<f64>,
    /// Also report the estimate and interval on the exponential scale.
    #[arg(long)]
    pub exponentiate: bool,
}

fn read_estimates(path: &Path) -> Result<Vec<Estimate>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut estimates = Vec::new();
    for (line, row) in reader.deserialize::<Estimate>().enumerate() {
        estimates.push(row.with_context(|| format!("parsing row {}", line + 1))?);
    }
    Ok(estimates)
}

#[instrument]
pub async fn run(args: Args) -> Result<()> {
    let estimates = read_estimates(&args.input)?;
    let pooled = pool_with(
        &estimates,
        &PoolingOptions {
            conf_level: args.conf_level,
            dfcom: args.dfcom,
        },
    )?;
    let mut out = serde_json::to_value(pooled)?;
    if args.exponentiate {
        let (ratio, low, high) = pooled.exponentiated();
        out["exp_estimate"] = ratio.into();
        out["exp_ci_low"] = low.into();
        out["exp_ci_high"] = high.into();
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
