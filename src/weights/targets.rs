//! External target marginal distributions for raking.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    data::records::RecordSet,
    error::{CausalError, Result},
};

const SUM_TOLERANCE: f64 = 1e-6;

/// Covariate name to `{level label: target proportion}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetDistributions(IndexMap<String, IndexMap<String, f64>>);

impl TargetDistributions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the target proportions for one covariate.
    pub fn with_target<I, S>(mut self, covariate: impl Into<String>, proportions: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.0.insert(
            covariate.into(),
            proportions
                .into_iter()
                .map(|(label, p)| (label.into(), p))
                .collect(),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn covariates(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, covariate: &str) -> Option<&IndexMap<String, f64>> {
        self.0.get(covariate)
    }

    /// Check proportions without looking at any data.
    pub fn validate_proportions(&self) -> Result<()> {
        for (covariate, levels) in &self.0 {
            let invalid = |reason: String| CausalError::InvalidTarget {
                covariate: covariate.clone(),
                reason,
            };
            if levels.is_empty() {
                return Err(invalid("no levels given".to_string()));
            }
            if let Some((label, p)) = levels.iter().find(|(_, p)| !(p.is_finite() && **p >= 0.0)) {
                return Err(invalid(format!("proportion {p} for `{label}`")));
            }
            let total: f64 = levels.values().sum();
            if (total - 1.0).abs() > SUM_TOLERANCE {
                return Err(invalid(format!("proportions sum to {total}, expected 1")));
            }
        }
        Ok(())
    }

    /// Resolve every targeted covariate against the record set.
    pub(crate) fn margins(&self, records: &RecordSet) -> Result<Vec<Margin>> {
        self.validate_proportions()?;
        let mut margins = Vec::with_capacity(self.0.len());
        for (covariate, levels) in &self.0 {
            let factor = records.factor(covariate)?;
            let data_levels: HashSet<&str> = factor.levels().iter().map(String::as_str).collect();
            let target_levels: HashSet<&str> = levels.keys().map(String::as_str).collect();
            let mut missing_in_targets: Vec<String> = data_levels
                .difference(&target_levels)
                .map(|s| s.to_string())
                .collect();
            let mut missing_in_data: Vec<String> = target_levels
                .difference(&data_levels)
                .map(|s| s.to_string())
                .collect();
            if !missing_in_targets.is_empty() || !missing_in_data.is_empty() {
                missing_in_targets.sort();
                missing_in_data.sort();
                return Err(CausalError::TargetSpecMismatch {
                    covariate: covariate.clone(),
                    missing_in_targets,
                    missing_in_data,
                });
            }
            let targets: Vec<f64> = factor
                .levels()
                .iter()
                .map(|level| levels.get(level).copied().unwrap_or(0.0))
                .collect();
            margins.push(Margin {
                covariate: covariate.clone(),
                labels: factor.levels().to_vec(),
                codes: factor.codes().to_vec(),
                targets,
            });
        }
        Ok(margins)
    }
}

/// One targeted covariate aligned with record rows.
#[derive(Debug, Clone)]
pub(crate) struct Margin {
    pub covariate: String,
    pub labels: Vec<String>,
    pub codes: Vec<usize>,
    pub targets: Vec<f64>,
}

impl Margin {
    /// Weighted proportion of each level among `rows`.
    pub fn proportions(&self, weights: &[f64], rows: &[usize]) -> Vec<f64> {
        let mut sums = vec![0.0; self.labels.len()];
        for &row in rows {
            sums[self.codes[row]] += weights[row];
        }
        let total: f64 = sums.iter().sum();
        if total > 0.0 {
            sums.iter_mut().for_each(|s| *s /= total);
        }
        sums
    }
}
