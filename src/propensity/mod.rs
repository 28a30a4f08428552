//! Per-imputation propensity matching and weighting.

pub mod matching;
pub mod model;
pub mod weighting;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    data::records::RecordSet,
    error::{CausalError, Result},
};

pub use matching::MatchingConfig;
pub use model::{FittedPropensity, LogisticPropensity, ModelSpec, PropensityFitter};
pub use weighting::WeightingConfig;

/// Target estimand of the matched or weighted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Estimand {
    #[default]
    Att,
    Ate,
    Atc,
}

/// Non-fatal data sufficiency condition raised while matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum DataWarning {
    InsufficientControls {
        focal: usize,
        candidates: usize,
        ratio: usize,
    },
    UnmatchedFocal {
        count: usize,
        focal: usize,
    },
}

impl fmt::Display for DataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientControls {
                focal,
                candidates,
                ratio,
            } => write!(
                f,
                "fewer candidates ({candidates}) than focal units ({focal}) x ratio {ratio}"
            ),
            Self::UnmatchedFocal { count, focal } => {
                write!(f, "{count} of {focal} focal units left unmatched")
            }
        }
    }
}

/// Matching or weighting with its mode-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Mode {
    Matching(MatchingConfig),
    Weighting(WeightingConfig),
}

impl Mode {
    pub fn estimand(&self) -> Estimand {
        match self {
            Self::Matching(cfg) => cfg.estimand,
            Self::Weighting(cfg) => cfg.estimand,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Matching(cfg) => cfg.validate(),
            Self::Weighting(cfg) => cfg.validate(),
        }
    }

    pub fn is_matching(&self) -> bool {
        matches!(self, Self::Matching(_))
    }
}

/// Rule deciding which records take part in raking.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", content = "epsilon", rename_all = "snake_case")]
pub enum EligibilityRule {
    /// Base weight exactly different from zero.
    #[default]
    NonZero,
    /// Base weight strictly above the given threshold.
    AboveThreshold(f64),
}

impl EligibilityRule {
    pub fn is_eligible(&self, weight: f64) -> bool {
        match self {
            Self::NonZero => weight != 0.0,
            Self::AboveThreshold(eps) => weight > *eps,
        }
    }
}

/// Matched or weighted view of the complete record set.
///
/// Holds every input row in input order, matched or not.
#[derive(Debug, Clone)]
pub struct MatchWeightResult {
    pub records: RecordSet,
    pub treated: Vec<bool>,
    pub propensity: Vec<f64>,
    pub distance: Vec<f64>,
    pub base_weights: Vec<f64>,
    pub subclass: Vec<Option<usize>>,
    pub models: Vec<FittedPropensity>,
    pub mode: Mode,
    pub warnings: Vec<DataWarning>,
}

impl MatchWeightResult {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn eligibility(&self, rule: EligibilityRule) -> Vec<bool> {
        self.base_weights
            .iter()
            .map(|&w| rule.is_eligible(w))
            .collect()
    }

    pub fn estimand(&self) -> Estimand {
        self.mode.estimand()
    }

    /// Number of records with a positive base weight, per arm (treated, control).
    pub fn retained(&self) -> (usize, usize) {
        self.base_weights
            .iter()
            .zip(&self.treated)
            .filter(|(&w, _)| w > 0.0)
            .fold((0, 0), |(t, c), (_, &treated)| {
                if treated {
                    (t + 1, c)
                } else {
                    (t, c + 1)
                }
            })
    }
}

/// Fit the propensity model and derive base weights for one complete dataset.
#[instrument(skip_all, fields(records = records.len()))]
pub fn estimate_base_weights(
    records: &RecordSet,
    spec: &ModelSpec,
    mode: &Mode,
    fitter: &dyn PropensityFitter,
    seed: u64,
) -> Result<MatchWeightResult> {
    mode.validate()?;
    let treated = records.indicator(&spec.treatment)?;
    let model = fitter.fit(records, spec)?;
    if model.scores.len() != records.len() {
        return Err(CausalError::ModelFit(format!(
            "fitter returned {} scores for {} records",
            model.scores.len(),
            records.len()
        )));
    }
    if let Some(row) = model
        .scores
        .iter()
        .position(|p| !(p.is_finite() && *p > 0.0 && *p < 1.0))
    {
        return Err(CausalError::ModelFit(format!(
            "propensity score {} at row {row} is outside (0, 1)",
            model.scores[row]
        )));
    }
    let propensity = model.scores.clone();

    let (distance, base_weights, subclass, warnings) = match mode {
        Mode::Matching(cfg) => {
            let distance: Vec<f64> = propensity
                .iter()
                .map(|&p| cfg.distance.transform(p))
                .collect();
            let outcome = matching::nearest_neighbor(&distance, &treated, cfg, seed)?;
            (distance, outcome.weights, outcome.subclass, outcome.warnings)
        }
        Mode::Weighting(cfg) => {
            let weights = weighting::estimate_weights(&propensity, &treated, cfg)?;
            (
                propensity.clone(),
                weights,
                vec![None; records.len()],
                Vec::new(),
            )
        }
    };

    for warning in &warnings {
        warn!(%warning, "data sufficiency warning");
    }
    let result = MatchWeightResult {
        records: records.clone(),
        treated,
        propensity,
        distance,
        base_weights,
        subclass,
        models: vec![model],
        mode: mode.clone(),
        warnings,
    };
    let (kept_treated, kept_control) = result.retained();
    info!(kept_treated, kept_control, "derived base weights");
    Ok(result)
}
