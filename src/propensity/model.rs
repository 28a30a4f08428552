//! Treatment-assignment model specification and the logistic fitter.

use linfa::{dataset::DatasetBase, prelude::Fit};
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, warn};

use crate::{
    data::records::{Column, RecordSet},
    error::{CausalError, Result},
};

/// Structured `treatment ~ predictors` specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Binary 0/1 treatment column.
    pub treatment: String,
    /// Covariates entering the propensity model.
    pub predictors: Vec<String>,
}

impl ModelSpec {
    pub fn new<I, S>(treatment: impl Into<String>, predictors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            treatment: treatment.into(),
            predictors: predictors.into_iter().map(Into::into).collect(),
        }
    }

    /// Check that every referenced column exists and the treatment is binary.
    pub fn validate(&self, records: &RecordSet) -> Result<()> {
        if self.predictors.is_empty() {
            return Err(CausalError::InvalidConfig(
                "propensity model needs at least one predictor".to_string(),
            ));
        }
        if self.predictors.iter().any(|p| p == &self.treatment) {
            return Err(CausalError::InvalidConfig(format!(
                "treatment `{}` cannot also be a predictor",
                self.treatment
            )));
        }
        let treated = records.indicator(&self.treatment)?;
        if treated.iter().all(|&t| t) || treated.iter().all(|&t| !t) {
            return Err(CausalError::NotBinary {
                column: self.treatment.clone(),
                reason: "only one treatment arm present".to_string(),
            });
        }
        for predictor in &self.predictors {
            if let Column::Numeric(values) = records.column(predictor)? {
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(CausalError::InvalidConfig(format!(
                        "predictor `{predictor}` has non-finite values"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Fitted propensity model: coefficients on the design scale plus scores.
#[derive(Debug, Clone, Serialize)]
pub struct FittedPropensity {
    pub intercept: f64,
    /// Design column name and coefficient (standardized scale for numerics).
    pub coefficients: Vec<(String, f64)>,
    /// Fitted probability of treatment per record.
    pub scores: Vec<f64>,
    /// Stratum the model was fitted in, if any.
    pub stratum: Option<String>,
}

/// Anything able to produce per-record treatment probabilities.
pub trait PropensityFitter: Send + Sync {
    fn fit(&self, records: &RecordSet, spec: &ModelSpec) -> Result<FittedPropensity>;
}

/// Unpenalized logistic regression with intercept.
#[derive(Debug, Clone)]
pub struct LogisticPropensity {
    pub max_iterations: u64,
    pub gradient_tolerance: f64,
}

impl Default for LogisticPropensity {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            gradient_tolerance: 1e-8,
        }
    }
}

/// Numeric design matrix built from predictors.
struct Design {
    names: Vec<String>,
    matrix: Array2<f64>,
}

fn build_design(records: &RecordSet, predictors: &[String]) -> Result<Design> {
    let n = records.len();
    let mut names = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for predictor in predictors {
        match records.column(predictor)? {
            Column::Numeric(values) => {
                let mean = values.mean();
                let sd = if n < 2 { 0.0 } else { values.std_dev() };
                if !(sd > f64::EPSILON) {
                    warn!(%predictor, "dropping constant predictor");
                    continue;
                }
                names.push(predictor.clone());
                columns.push(values.iter().map(|v| (v - mean) / sd).collect());
            }
            Column::Categorical(factor) => {
                for (code, level) in factor.levels().iter().enumerate().skip(1) {
                    let dummy: Vec<f64> = factor
                        .codes()
                        .iter()
                        .map(|&c| if c == code { 1.0 } else { 0.0 })
                        .collect();
                    let count = dummy.iter().filter(|&&v| v > 0.0).count();
                    if count == 0 || count == n {
                        warn!(%predictor, %level, "dropping aliased factor level");
                        continue;
                    }
                    names.push(format!("{predictor}{level}"));
                    columns.push(dummy);
                }
            }
        }
    }
    if columns.is_empty() {
        return Err(CausalError::ModelFit(
            "no non-constant predictors left in the design".to_string(),
        ));
    }
    let p = columns.len();
    let mut matrix = Array2::zeros((n, p));
    for (j, col) in columns.into_iter().enumerate() {
        for (i, value) in col.into_iter().enumerate() {
            matrix[[i, j]] = value;
        }
    }
    Ok(Design { names, matrix })
}

impl PropensityFitter for LogisticPropensity {
    fn fit(&self, records: &RecordSet, spec: &ModelSpec) -> Result<FittedPropensity> {
        spec.validate(records)?;
        let treated = records.indicator(&spec.treatment)?;
        let design = build_design(records, &spec.predictors)?;
        let targets = Array1::from(treated);
        let dataset = DatasetBase::new(design.matrix.clone(), targets);

        let fitted = LogisticRegression::default()
            .with_intercept(true)
            .alpha(0.0)
            .max_iterations(self.max_iterations)
            .gradient_tolerance(self.gradient_tolerance)
            .fit(&dataset)
            .map_err(|err| CausalError::ModelFit(err.to_string()))?;

        // The positive class is whichever label linfa picked; orient on "treated".
        let treated_is_positive = fitted.labels().pos.class;
        let raw = fitted.predict_probabilities(&design.matrix);
        let scores: Vec<f64> = raw
            .iter()
            .map(|&p| if treated_is_positive { p } else { 1.0 - p })
            .collect();
        if let Some(row) = scores.iter().position(|p| !(p.is_finite() && *p > 0.0 && *p < 1.0)) {
            return Err(CausalError::ModelFit(format!(
                "fitted probability {} at row {row} (separation)",
                scores[row]
            )));
        }

        let sign = if treated_is_positive { 1.0 } else { -1.0 };
        let coefficients = design
            .names
            .into_iter()
            .zip(fitted.params().iter().map(|b| sign * b))
            .collect();
        debug!(records = records.len(), "fitted logistic propensity model");
        Ok(FittedPropensity {
            intercept: sign * fitted.intercept(),
            coefficients,
            scores,
            stratum: None,
        })
    }
}
