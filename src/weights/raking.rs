//! Iterative proportional fitting of record weights to target marginals.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    data::records::RecordSet,
    error::{CausalError, Result},
    weights::targets::{Margin, TargetDistributions},
};

/// What to do when the iteration limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// Return `CausalError::NonConvergence`.
    #[default]
    Error,
    /// Return the last weights with a `NotConverged` status.
    Flag,
}

/// Which eligible records are raked together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RakingScope {
    /// Each treatment arm is raked to the targets separately.
    #[default]
    WithinTreatmentArms,
    /// All eligible records are raked as one sample.
    Pooled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RakingConfig {
    /// Largest tolerated |achieved - target| proportion.
    pub tolerance: f64,
    /// Maximum number of full passes over all targeted covariates.
    pub max_iterations: usize,
    pub on_non_convergence: ConvergencePolicy,
    pub scope: RakingScope,
}

impl Default for RakingConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 1000,
            on_non_convergence: ConvergencePolicy::Error,
            scope: RakingScope::WithinTreatmentArms,
        }
    }
}

impl RakingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(CausalError::InvalidConfig(format!(
                "raking tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(CausalError::InvalidConfig(
                "raking needs at least one iteration".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RakingStatus {
    /// No targets were supplied; base weights passed through.
    NotRequested,
    Converged {
        iterations: usize,
        max_deviation: f64,
    },
    NotConverged {
        iterations: usize,
        max_deviation: f64,
    },
}

impl RakingStatus {
    pub fn is_requested(&self) -> bool {
        !matches!(self, Self::NotRequested)
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub fn iterations(&self) -> usize {
        match self {
            Self::NotRequested => 0,
            Self::Converged { iterations, .. } | Self::NotConverged { iterations, .. } => {
                *iterations
            }
        }
    }

    /// Combine the status of independently raked groups.
    pub(crate) fn merge(self, other: Self) -> Self {
        use RakingStatus::*;
        match (self, other) {
            (NotRequested, s) | (s, NotRequested) => s,
            (
                Converged {
                    iterations: a,
                    max_deviation: da,
                },
                Converged {
                    iterations: b,
                    max_deviation: db,
                },
            ) => Converged {
                iterations: a.max(b),
                max_deviation: da.max(db),
            },
            (a, b) => NotConverged {
                iterations: a.iterations().max(b.iterations()),
                max_deviation: a.max_deviation().max(b.max_deviation()),
            },
        }
    }

    pub fn max_deviation(&self) -> f64 {
        match self {
            Self::NotRequested => 0.0,
            Self::Converged { max_deviation, .. } | Self::NotConverged { max_deviation, .. } => {
                *max_deviation
            }
        }
    }
}

/// Raking weights aligned with the record set.
#[derive(Debug, Clone, PartialEq)]
pub struct RakingOutcome {
    /// `None` for records that did not take part in raking.
    pub weights: Vec<Option<f64>>,
    pub status: RakingStatus,
}

impl RakingOutcome {
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }

    pub fn iterations(&self) -> usize {
        self.status.iterations()
    }
}

fn check_inputs(records: &RecordSet, base_weights: &[f64], eligible: &[bool]) -> Result<()> {
    for (column, got) in [("base_weights", base_weights.len()), ("eligible", eligible.len())] {
        if got != records.len() {
            return Err(CausalError::LengthMismatch {
                column: column.to_string(),
                expected: records.len(),
                got,
            });
        }
    }
    if let Some(row) = base_weights.iter().position(|w| !(w.is_finite() && *w >= 0.0)) {
        return Err(CausalError::InvalidConfig(format!(
            "base weight {} at row {row} is not a finite non-negative number",
            base_weights[row]
        )));
    }
    Ok(())
}

fn max_deviation(margins: &[Margin], weights: &[f64], rows: &[usize]) -> f64 {
    margins
        .iter()
        .flat_map(|margin| {
            margin
                .proportions(weights, rows)
                .into_iter()
                .zip(margin.targets.iter())
                .map(|(achieved, target)| (achieved - target).abs())
                .collect::<Vec<_>>()
        })
        .fold(0.0, f64::max)
}

/// Rake eligible records so their weighted marginals match `targets`.
///
/// Ineligible records never influence the fit and get `None`. Without
/// targets the base weights pass through with `RakingStatus::NotRequested`.
pub fn rake(
    records: &RecordSet,
    targets: Option<&TargetDistributions>,
    base_weights: &[f64],
    eligible: &[bool],
    config: &RakingConfig,
) -> Result<RakingOutcome> {
    check_inputs(records, base_weights, eligible)?;
    let targets = match targets {
        Some(targets) if !targets.is_empty() => targets,
        _ => {
            debug!("no target distributions supplied; raking skipped");
            return Ok(RakingOutcome {
                weights: base_weights.iter().copied().map(Some).collect(),
                status: RakingStatus::NotRequested,
            });
        }
    };
    config.validate()?;
    let margins = targets.margins(records)?;

    let rows: Vec<usize> = (0..records.len()).filter(|&row| eligible[row]).collect();
    if rows.is_empty() {
        return Err(CausalError::NoEligibleRecords);
    }

    let mut weights = base_weights.to_vec();
    let mut status = None;
    for iteration in 1..=config.max_iterations {
        for margin in &margins {
            let achieved = margin.proportions(&weights, &rows);
            let mut factors = vec![1.0; achieved.len()];
            for (level, (&current, &target)) in achieved.iter().zip(&margin.targets).enumerate() {
                if current > 0.0 {
                    factors[level] = target / current;
                } else if target > 0.0 {
                    return Err(CausalError::EmptyLevel {
                        covariate: margin.covariate.clone(),
                        level: margin.labels[level].clone(),
                        target,
                    });
                }
            }
            for &row in &rows {
                weights[row] *= factors[margin.codes[row]];
            }
        }

        let deviation = max_deviation(&margins, &weights, &rows);
        if deviation < config.tolerance {
            status = Some(RakingStatus::Converged {
                iterations: iteration,
                max_deviation: deviation,
            });
            break;
        }
        if iteration == config.max_iterations {
            status = Some(RakingStatus::NotConverged {
                iterations: iteration,
                max_deviation: deviation,
            });
        }
    }

    let status = status.unwrap_or(RakingStatus::NotConverged {
        iterations: config.max_iterations,
        max_deviation: f64::NAN,
    });
    match &status {
        RakingStatus::Converged {
            iterations,
            max_deviation,
        } => info!(
            iterations,
            max_deviation,
            eligible = rows.len(),
            "raking converged"
        ),
        RakingStatus::NotConverged {
            iterations,
            max_deviation,
        } => {
            if config.on_non_convergence == ConvergencePolicy::Error {
                return Err(CausalError::NonConvergence {
                    iterations: *iterations,
                    max_deviation: *max_deviation,
                });
            }
            warn!(iterations, max_deviation, "raking did not converge");
        }
        RakingStatus::NotRequested => {}
    }

    let weights = weights
        .into_iter()
        .zip(eligible)
        .map(|(w, &keep)| keep.then_some(w))
        .collect();
    Ok(RakingOutcome { weights, status })
}

/// Rake each group (e.g. treatment arm) separately and merge the results.
pub fn rake_within_groups(
    records: &RecordSet,
    targets: Option<&TargetDistributions>,
    base_weights: &[f64],
    eligible: &[bool],
    groups: &[bool],
    config: &RakingConfig,
) -> Result<RakingOutcome> {
    if groups.len() != records.len() {
        return Err(CausalError::LengthMismatch {
            column: "groups".to_string(),
            expected: records.len(),
            got: groups.len(),
        });
    }
    let mut merged = RakingOutcome {
        weights: vec![None; records.len()],
        status: RakingStatus::NotRequested,
    };
    for arm in [true, false] {
        let arm_eligible: Vec<bool> = eligible
            .iter()
            .zip(groups)
            .map(|(&e, &g)| e && g == arm)
            .collect();
        if targets.is_some_and(|t| !t.is_empty()) && !arm_eligible.contains(&true) {
            continue;
        }
        let part = rake(records, targets, base_weights, &arm_eligible, config)?;
        if !part.status.is_requested() {
            return Ok(part);
        }
        for (slot, weight) in merged.weights.iter_mut().zip(part.weights) {
            if weight.is_some() {
                *slot = weight;
            }
        }
        merged.status = merged.status.merge(part.status);
    }
    if !merged.status.is_requested() {
        return Err(CausalError::NoEligibleRecords);
    }
    Ok(merged)
}
