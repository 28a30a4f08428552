//! Marginal hazard ratio per imputation, pooled with Rubin's rules.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::{CausalError, Result},
    outcome::cox::{CoxConfig, CoxModel, SurvivalData, Ties},
    pipeline::orchestrator::RunOutput,
    pooling::rubin::{pool_with, Estimate, PooledEstimate, PoolingOptions},
    weights::compose::WeightedRecordSet,
};

const TREATMENT_TERM: &str = "treatment";

/// Grouping for the robust variance of the outcome model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBy {
    /// Match groups; records without one form their own cluster.
    #[default]
    Subclass,
    /// One cluster per record (robust, unclustered).
    CaseId,
    /// Model-based standard errors.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectConfig {
    pub time: String,
    pub event: String,
    pub cluster: ClusterBy,
    pub ties: Ties,
    pub conf_level: f64,
    pub dfcom: Option<f64>,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            time: "time".to_string(),
            event: "event".to_string(),
            cluster: ClusterBy::Subclass,
            ties: Ties::Efron,
            conf_level: 0.95,
            dfcom: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputationEffect {
    pub imputation: usize,
    pub estimate: f64,
    pub std_error: f64,
    pub hazard_ratio: f64,
    pub n: usize,
    pub n_events: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectSummary {
    pub per_imputation: Vec<ImputationEffect>,
    pub pooled: PooledEstimate,
    pub hazard_ratio: f64,
    pub hr_ci_low: f64,
    pub hr_ci_high: f64,
}

/// Weighted `Surv(time, event) ~ treatment` for one composed dataset.
pub fn fit_treatment_effect(set: &WeightedRecordSet, config: &EffectConfig) -> Result<(f64, f64, usize, usize)> {
    let records = set.records();
    let time = records.numeric(&config.time)?.to_vec();
    let event = records.indicator(&config.event)?;
    let treatment = set
        .treated()
        .iter()
        .map(|&t| if t { 1.0 } else { 0.0 })
        .collect();
    let mut data = SurvivalData::new(time, event, set.final_weights().to_vec())?
        .with_covariate(TREATMENT_TERM, treatment)?;
    data = match config.cluster {
        ClusterBy::None => data,
        ClusterBy::CaseId => data.with_clusters(set.caseid().to_vec())?,
        ClusterBy::Subclass => {
            let labels = set
                .subclass()
                .iter()
                .enumerate()
                .map(|(row, s)| match s {
                    Some(group) => *group as i64,
                    None => -(row as i64) - 1,
                })
                .collect();
            data.with_clusters(labels)?
        }
    };
    let fit = CoxModel::new(CoxConfig {
        ties: config.ties,
        ..CoxConfig::default()
    })
    .fit(&data)?;
    let coef = fit
        .coefficient(TREATMENT_TERM)
        .ok_or_else(|| CausalError::OutcomeFit("treatment term missing from fit".to_string()))?;
    Ok((coef.estimate, coef.std_error, fit.n, fit.n_events))
}

/// Fit the outcome model on every successful imputation and pool.
#[instrument(skip_all, fields(imputations = run.results().len()))]
pub fn estimate_effect(
    run: &RunOutput,
    config: &EffectConfig,
    acknowledge_partial: bool,
) -> Result<EffectSummary> {
    run.weighted_sets(acknowledge_partial)?;
    let per_imputation = run
        .results()
        .par_iter()
        .map(|(imputation, set)| {
            fit_treatment_effect(set, config)
                .map(|(estimate, std_error, n, n_events)| ImputationEffect {
                    imputation: *imputation,
                    estimate,
                    std_error,
                    hazard_ratio: estimate.exp(),
                    n,
                    n_events,
                })
                .map_err(|err| err.in_imputation(*imputation))
        })
        .collect::<Result<Vec<_>>>()?;

    let estimates: Vec<Estimate> = per_imputation
        .iter()
        .map(|e| Estimate::new(e.estimate, e.std_error))
        .collect();
    let pooled = pool_with(
        &estimates,
        &PoolingOptions {
            conf_level: config.conf_level,
            dfcom: config.dfcom,
        },
    )?;
    let (hazard_ratio, hr_ci_low, hr_ci_high) = pooled.exponentiated();
    info!(
        hazard_ratio,
        hr_ci_low,
        hr_ci_high,
        m = pooled.m,
        "pooled treatment effect"
    );
    Ok(EffectSummary {
        per_imputation,
        pooled,
        hazard_ratio,
        hr_ci_low,
        hr_ci_high,
    })
}
