//! CLI entry-point for the full match/re-weight/pool analysis.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use polars::prelude::{DataFrame, NamedFrom, Series};
use tracing::{info, instrument, warn};

use crate::{
    balance,
    config::{load_analysis, AnalysisConfig, Settings},
    data::io,
    pipeline::{
        effects::{estimate_effect, EffectSummary},
        orchestrator::{run_across_imputations, RunOptions, RunOutput},
    },
    propensity::LogisticPropensity,
};

/// Args for the `analyze` command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// Long table with one block of rows per imputation (.csv or .parquet).
    #[arg(long)]
    pub input: PathBuf,
    /// Analysis configuration (JSON).
    #[arg(long)]
    pub config: PathBuf,
    /// Pool even if some imputations failed under fail-soft.
    #[arg(long)]
    pub acknowledge_partial: bool,
}

fn effects_frame(summary: &EffectSummary) -> Result<DataFrame> {
    let mut scope = Vec::new();
    let mut imputation: Vec<Option<i64>> = Vec::new();
    let mut estimate = Vec::new();
    let mut std_error = Vec::new();
    let mut hazard_ratio = Vec::new();
    let mut ci_low: Vec<Option<f64>> = Vec::new();
    let mut ci_high: Vec<Option<f64>> = Vec::new();
    let mut df: Vec<Option<f64>> = Vec::new();
    let mut p_value: Vec<Option<f64>> = Vec::new();
    for row in &summary.per_imputation {
        scope.push("imputation".to_string());
        imputation.push(Some(row.imputation as i64));
        estimate.push(row.estimate);
        std_error.push(row.std_error);
        hazard_ratio.push(row.hazard_ratio);
        ci_low.push(None);
        ci_high.push(None);
        df.push(None);
        p_value.push(None);
    }
    let pooled = &summary.pooled;
    scope.push("pooled".to_string());
    imputation.push(None);
    estimate.push(pooled.estimate);
    std_error.push(pooled.std_error);
    hazard_ratio.push(summary.hazard_ratio);
    ci_low.push(Some(summary.hr_ci_low));
    ci_high.push(Some(summary.hr_ci_high));
    df.push(Some(pooled.df));
    p_value.push(Some(pooled.p_value));

    Ok(DataFrame::new(vec![
        Series::new("scope".into(), scope),
        Series::new("imputation".into(), imputation),
        Series::new("log_hr".into(), estimate),
        Series::new("std_error".into(), std_error),
        Series::new("hazard_ratio".into(), hazard_ratio),
        Series::new("hr_ci_low".into(), ci_low),
        Series::new("hr_ci_high".into(), ci_high),
        Series::new("df".into(), df),
        Series::new("p_value".into(), p_value),
    ])?)
}

fn analyze(args: &Args, analysis: &AnalysisConfig, settings: &Settings) -> Result<()> {
    let table = io::read_long_table(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let datasets = io::imputed_from_long(
        &table,
        &analysis.id_column,
        &analysis.imputation_column,
        &analysis.categorical,
    )?;
    info!(
        imputations = datasets.len(),
        records = datasets.n_records(),
        "loaded imputed datasets"
    );

    let options = RunOptions {
        stratify_by: analysis.stratify_by.clone(),
        failure_policy: analysis.failure_policy,
        seed: settings.seed,
        threads: settings.threads,
    };
    let fitter = LogisticPropensity::default();
    let run = run_across_imputations(&datasets, &analysis.pipeline, &fitter, &options)?;
    run.report
        .write_json(&settings.join_output("run_report.json"))
        .context("writing run report")?;

    let mut weights = io::weights_frame(&run, &analysis.id_column, &analysis.imputation_column)?;
    io::write_frame(&mut weights, &settings.join_output("weights_long.parquet"))?;

    write_balance(&run, analysis, settings)?;

    if let Some(effect) = &analysis.effect {
        let summary = estimate_effect(&run, effect, args.acknowledge_partial)?;
        info!(
            hazard_ratio = summary.hazard_ratio,
            ci_low = summary.hr_ci_low,
            ci_high = summary.hr_ci_high,
            "pooled hazard ratio"
        );
        let mut frame = effects_frame(&summary)?;
        io::write_frame(&mut frame, &settings.join_output("effects.csv"))?;
    } else {
        warn!("no effect configuration; skipping outcome model");
    }
    Ok(())
}

fn write_balance(run: &RunOutput, analysis: &AnalysisConfig, settings: &Settings) -> Result<()> {
    let estimand = analysis.pipeline.mode.estimand();
    let tables = run
        .results()
        .iter()
        .map(|(_, set)| balance::assess(set, analysis.balance_covariates(), estimand))
        .collect::<crate::error::Result<Vec<_>>>()?;
    if tables.is_empty() {
        warn!("no successful imputations; balance table skipped");
        return Ok(());
    }
    let mut frame = balance::average(&tables)?.to_frame()?;
    io::write_frame(&mut frame, &settings.join_output("balance.csv"))
        .context("writing balance table")
}

#[instrument(skip(settings))]
pub async fn run(args: Args, settings: Settings) -> Result<()> {
    let analysis = load_analysis(&args.config)?;
    tokio::task::spawn_blocking(move || analyze(&args, &analysis, &settings)).await?
}
