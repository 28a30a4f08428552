//! Independent match/weight runs across imputations (and strata).

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::{
    data::{imputed::ImputedDatasets, records::RecordSet},
    error::{CausalError, Result},
    pipeline::{
        match_or_weight,
        report::{ImputationReport, RunReport, StratumSeed, UnitSeeds},
        PipelineConfig,
    },
    propensity::PropensityFitter,
    weights::compose::WeightedRecordSet,
};

/// Whether one failed imputation aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    /// Keep going and record the failed indices in the report.
    FailSoft,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Categorical column splitting each dataset into independently fitted strata.
    pub stratify_by: Option<String>,
    pub failure_policy: FailurePolicy,
    pub seed: u64,
    /// Worker bound; the rayon default (one per core) when unset.
    pub threads: Option<usize>,
}

/// Seed for one (imputation, stratum) unit of work.
///
/// `stratum` is 0 for unstratified runs and 1-based otherwise.
pub fn derive_seed(seed: u64, imputation: usize, stratum: usize) -> u64 {
    let mut z = seed
        ^ (imputation as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (stratum as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Collected outputs of one orchestrated run.
#[derive(Debug)]
pub struct RunOutput {
    expected: usize,
    results: Vec<(usize, WeightedRecordSet)>,
    failures: Vec<(usize, CausalError)>,
    pub report: RunReport,
}

impl RunOutput {
    /// Number of imputations the run was asked to process (M).
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() == self.expected
    }

    /// Successful `(imputation, result)` pairs in imputation order.
    pub fn results(&self) -> &[(usize, WeightedRecordSet)] {
        &self.results
    }

    pub fn failures(&self) -> &[(usize, CausalError)] {
        &self.failures
    }

    /// Results handed on for pooling.
    ///
    /// A partial collection is refused unless `acknowledge_partial` is set.
    pub fn weighted_sets(&self, acknowledge_partial: bool) -> Result<Vec<&WeightedRecordSet>> {
        if !self.is_complete() && !acknowledge_partial {
            return Err(CausalError::PartialPooling {
                available: self.results.len(),
                expected: self.expected,
            });
        }
        if self.results.is_empty() {
            return Err(CausalError::EmptyPool);
        }
        Ok(self.results.iter().map(|(_, set)| set).collect())
    }
}

fn check_stratifier(
    records: &RecordSet,
    config: &PipelineConfig,
    stratify_by: &str,
) -> Result<()> {
    records.factor(stratify_by)?;
    if config
        .targets
        .as_ref()
        .is_some_and(|t| t.get(stratify_by).is_some())
    {
        return Err(CausalError::InvalidConfig(format!(
            "stratification variable `{stratify_by}` cannot also be a raking target"
        )));
    }
    if stratify_by == config.model.treatment {
        return Err(CausalError::InvalidConfig(
            "cannot stratify on the treatment indicator".to_string(),
        ));
    }
    Ok(())
}

fn run_one(
    imputation: usize,
    records: &RecordSet,
    config: &PipelineConfig,
    fitter: &dyn PropensityFitter,
    options: &RunOptions,
) -> (UnitSeeds, Result<WeightedRecordSet>) {
    let Some(column) = options.stratify_by.as_deref() else {
        let seed = derive_seed(options.seed, imputation, 0);
        return (UnitSeeds::Single(seed), match_or_weight(records, config, fitter, seed));
    };
    let mut seeds = Vec::new();
    let result = run_strata(imputation, records, column, config, fitter, options, &mut seeds);
    (UnitSeeds::Strata(seeds), result)
}

fn run_strata(
    imputation: usize,
    records: &RecordSet,
    column: &str,
    config: &PipelineConfig,
    fitter: &dyn PropensityFitter,
    options: &RunOptions,
    seeds: &mut Vec<StratumSeed>,
) -> Result<WeightedRecordSet> {
    // Strata see the full-data levels of integer-coded targets.
    let targeted = config.targets.iter().flat_map(|t| t.covariates());
    let pinned = records.clone().pin_levels(targeted.chain([column]))?;
    let strata = pinned.partition_by(column)?;
    let mut parts = Vec::with_capacity(strata.len());
    for (idx, (label, rows)) in strata.into_iter().enumerate() {
        let seed = derive_seed(options.seed, imputation, idx + 1);
        seeds.push(StratumSeed {
            stratum: label.clone(),
            seed,
        });
        let subset = pinned.subset(&rows);
        let part = match_or_weight(&subset, config, fitter, seed).map_err(|err| {
            warn!(imputation, stratum = %label, %err, "stratum failed");
            err
        })?;
        parts.push((rows, part.tag_stratum(&label)));
    }
    WeightedRecordSet::from_strata(records, parts)
}

/// Run match/weight, raking and composition on every imputed dataset.
///
/// Configuration is checked against every dataset before any fitting.
/// Under `FailFast` the lowest failing imputation is returned as
/// `ImputationFailed`; under `FailSoft` failures land in the report.
#[instrument(skip_all, fields(imputations = datasets.len(), policy = ?options.failure_policy))]
pub fn run_across_imputations(
    datasets: &ImputedDatasets,
    config: &PipelineConfig,
    fitter: &dyn PropensityFitter,
    options: &RunOptions,
) -> Result<RunOutput> {
    for (imputation, records) in datasets.iter() {
        config
            .validate(records)
            .map_err(|err| err.in_imputation(imputation))?;
        if let Some(column) = options.stratify_by.as_deref() {
            check_stratifier(records, config, column).map_err(|err| err.in_imputation(imputation))?;
        }
    }

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(threads) = options.threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder
        .build()
        .map_err(|err| CausalError::InvalidConfig(format!("worker pool: {err}")))?;

    let outcomes: Vec<(usize, UnitSeeds, Result<WeightedRecordSet>)> = pool.install(|| {
        datasets
            .as_slice()
            .par_iter()
            .enumerate()
            .map(|(idx, records)| {
                let imputation = idx + 1;
                let (seeds, outcome) = run_one(imputation, records, config, fitter, options);
                (imputation, seeds, outcome.map_err(|err| err.in_imputation(imputation)))
            })
            .collect()
    });

    let mut results = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    let mut entries = Vec::with_capacity(outcomes.len());
    for (imputation, seeds, outcome) in outcomes {
        match outcome {
            Ok(set) => {
                entries.push(ImputationReport::success(imputation, seeds, &set));
                results.push((imputation, set));
            }
            Err(err) => {
                if options.failure_policy == FailurePolicy::FailFast {
                    error!(imputation, %err, "imputation failed; aborting run");
                    return Err(err);
                }
                warn!(imputation, %err, "imputation failed; continuing");
                entries.push(ImputationReport::failure(imputation, seeds, &err));
                failures.push((imputation, err));
            }
        }
    }

    let report = RunReport::new(
        entries,
        options.failure_policy,
        options.stratify_by.clone(),
        options.seed,
    );
    info!(
        succeeded = report.succeeded,
        total = report.total,
        "{}",
        report.summary()
    );
    Ok(RunOutput {
        expected: datasets.len(),
        results,
        failures,
        report,
    })
}
