//! Rubin's rules for combining estimates across imputations.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::debug;

use crate::error::{CausalError, Result};

/// Complete-data degrees of freedom used when none is given.
pub const LARGE_SAMPLE_DFCOM: f64 = 999_999.0;

const LAMBDA_FLOOR: f64 = 1e-4;

/// Point estimate and standard error from one imputed dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub estimate: f64,
    pub std_error: f64,
}

impl Estimate {
    pub fn new(estimate: f64, std_error: f64) -> Self {
        Self {
            estimate,
            std_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingOptions {
    pub conf_level: f64,
    /// Complete-data degrees of freedom for the Barnard-Rubin correction.
    pub dfcom: Option<f64>,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            conf_level: 0.95,
            dfcom: None,
        }
    }
}

impl PoolingOptions {
    fn validate(&self) -> Result<f64> {
        if !(self.conf_level > 0.0 && self.conf_level < 1.0) {
            return Err(CausalError::InvalidConfig(format!(
                "confidence level must lie in (0, 1), got {}",
                self.conf_level
            )));
        }
        let dfcom = self.dfcom.unwrap_or(LARGE_SAMPLE_DFCOM);
        if !(dfcom.is_finite() && dfcom > 0.0) {
            return Err(CausalError::InvalidConfig(format!(
                "complete-data degrees of freedom must be positive, got {dfcom}"
            )));
        }
        Ok(dfcom)
    }
}

/// Pooled inference for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PooledEstimate {
    pub m: usize,
    pub estimate: f64,
    pub std_error: f64,
    /// Mean squared standard error (Ū).
    pub within: f64,
    /// Sample variance of the estimates (B); zero when M = 1.
    pub between: f64,
    /// Ū + (1 + 1/M) B.
    pub total: f64,
    pub df: f64,
    /// Relative increase in variance due to nonresponse.
    pub riv: f64,
    pub lambda: f64,
    /// Fraction of missing information.
    pub fmi: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub p_value: f64,
    pub conf_level: f64,
}

impl PooledEstimate {
    /// Estimate and interval on the exponentiated scale (e.g. hazard ratio).
    pub fn exponentiated(&self) -> (f64, f64, f64) {
        (self.estimate.exp(), self.ci_low.exp(), self.ci_high.exp())
    }
}

fn t_dist(df: f64) -> Result<StudentsT> {
    StudentsT::new(0.0, 1.0, df)
        .map_err(|err| CausalError::InvalidConfig(format!("t distribution with df {df}: {err}")))
}

/// Pool with 95% intervals and large-sample complete-data df.
pub fn pool(estimates: &[Estimate]) -> Result<PooledEstimate> {
    pool_with(estimates, &PoolingOptions::default())
}

pub fn pool_with(estimates: &[Estimate], options: &PoolingOptions) -> Result<PooledEstimate> {
    if estimates.is_empty() {
        return Err(CausalError::EmptyPool);
    }
    let dfcom = options.validate()?;
    if let Some(bad) = estimates
        .iter()
        .find(|e| !e.estimate.is_finite() || !(e.std_error.is_finite() && e.std_error >= 0.0))
    {
        return Err(CausalError::InvalidConfig(format!(
            "cannot pool estimate {} with standard error {}",
            bad.estimate, bad.std_error
        )));
    }

    // Summation order is fixed so the result does not depend on input order.
    let mut sorted = estimates.to_vec();
    sorted.sort_by(|a, b| {
        a.estimate
            .total_cmp(&b.estimate)
            .then(a.std_error.total_cmp(&b.std_error))
    });

    let m = sorted.len();
    let mf = m as f64;
    let qbar = sorted.iter().map(|e| e.estimate).sum::<f64>() / mf;
    let within = sorted.iter().map(|e| e.std_error * e.std_error).sum::<f64>() / mf;
    let between = if m > 1 {
        sorted
            .iter()
            .map(|e| (e.estimate - qbar).powi(2))
            .sum::<f64>()
            / (mf - 1.0)
    } else {
        0.0
    };
    let inflated = (1.0 + 1.0 / mf) * between;
    let total = within + inflated;

    let lambda = if m > 1 {
        let raw = if total > 0.0 { inflated / total } else { 0.0 };
        raw.max(LAMBDA_FLOOR)
    } else {
        0.0
    };
    let riv = if within > 0.0 { inflated / within } else { 0.0 };
    let df_obs = (dfcom + 1.0) / (dfcom + 3.0) * dfcom * (1.0 - lambda);
    let df = if m > 1 {
        let df_old = (mf - 1.0) / (lambda * lambda);
        df_old * df_obs / (df_old + df_obs)
    } else {
        df_obs
    };
    let fmi = (riv + 2.0 / (df + 3.0)) / (1.0 + riv);

    let std_error = total.sqrt();
    let t = t_dist(df)?;
    let critical = t.inverse_cdf(0.5 + options.conf_level / 2.0);
    let p_value = if std_error > 0.0 {
        2.0 * (1.0 - t.cdf((qbar / std_error).abs()))
    } else if qbar == 0.0 {
        1.0
    } else {
        0.0
    };

    debug!(m, estimate = qbar, std_error, df, "pooled estimates");
    Ok(PooledEstimate {
        m,
        estimate: qbar,
        std_error,
        within,
        between,
        total,
        df,
        riv,
        lambda,
        fmi,
        ci_low: qbar - critical * std_error,
        ci_high: qbar + critical * std_error,
        p_value,
        conf_level: options.conf_level,
    })
}
