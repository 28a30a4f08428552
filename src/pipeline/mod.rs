//! Match/weight, rake and compose for one dataset, and across imputations.

pub mod effects;
pub mod orchestrator;
pub mod report;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    data::records::RecordSet,
    error::{CausalError, Result},
    propensity::{self, EligibilityRule, Mode, ModelSpec, PropensityFitter},
    weights::{
        compose::{compose, WeightedRecordSet},
        raking::{self, RakingConfig, RakingScope},
        targets::TargetDistributions,
    },
};

pub use orchestrator::{run_across_imputations, FailurePolicy, RunOptions, RunOutput};

/// Read-only configuration shared by every imputation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub model: ModelSpec,
    #[serde(flatten)]
    pub mode: Mode,
    #[serde(default)]
    pub targets: Option<TargetDistributions>,
    #[serde(default)]
    pub raking: RakingConfig,
    #[serde(default)]
    pub eligibility: EligibilityRule,
}

impl PipelineConfig {
    pub fn new(model: ModelSpec, mode: Mode) -> Self {
        Self {
            model,
            mode,
            targets: None,
            raking: RakingConfig::default(),
            eligibility: EligibilityRule::default(),
        }
    }

    pub fn with_targets(mut self, targets: TargetDistributions) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_raking(mut self, raking: RakingConfig) -> Self {
        self.raking = raking;
        self
    }

    pub fn with_eligibility(mut self, eligibility: EligibilityRule) -> Self {
        self.eligibility = eligibility;
        self
    }

    /// Configuration checks that need no model fitting.
    pub fn validate(&self, records: &RecordSet) -> Result<()> {
        self.mode.validate()?;
        self.model.validate(records)?;
        if let EligibilityRule::AboveThreshold(eps) = self.eligibility {
            if !(eps.is_finite() && eps >= 0.0) {
                return Err(CausalError::InvalidConfig(format!(
                    "eligibility threshold must be non-negative, got {eps}"
                )));
            }
        }
        if let Some(targets) = self.targets.as_ref().filter(|t| !t.is_empty()) {
            self.raking.validate()?;
            targets.margins(records)?;
        }
        Ok(())
    }
}

/// Full per-dataset pipeline: base weights, raking, composition.
///
/// Output rows are the input rows in input order, matched or not.
#[instrument(skip_all, fields(records = records.len(), seed))]
pub fn match_or_weight(
    records: &RecordSet,
    config: &PipelineConfig,
    fitter: &dyn PropensityFitter,
    seed: u64,
) -> Result<WeightedRecordSet> {
    config.validate(records)?;
    let base = propensity::estimate_base_weights(records, &config.model, &config.mode, fitter, seed)?;
    let eligible = base.eligibility(config.eligibility);
    let targets = config.targets.as_ref();
    let outcome = match config.raking.scope {
        RakingScope::WithinTreatmentArms => raking::rake_within_groups(
            &base.records,
            targets,
            &base.base_weights,
            &eligible,
            &base.treated,
            &config.raking,
        )?,
        RakingScope::Pooled => raking::rake(
            &base.records,
            targets,
            &base.base_weights,
            &eligible,
            &config.raking,
        )?,
    };
    debug!(status = ?outcome.status, "raking step finished");
    compose(base, outcome)
}
