//! Inverse-probability-of-treatment weights and quantile trimming.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{CausalError, Result},
    propensity::Estimand,
};

/// Cap extreme weights at a quantile of the weight distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimConfig {
    /// Quantile at which weights are capped (values below 0.5 are mirrored).
    pub at: f64,
    /// Also raise weights below the mirrored lower quantile.
    #[serde(default)]
    pub lower: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    pub estimand: Estimand,
    pub trim: Option<TrimConfig>,
}

impl WeightingConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(trim) = &self.trim {
            if !(trim.at > 0.0 && trim.at < 1.0) {
                return Err(CausalError::InvalidConfig(format!(
                    "trimming quantile must lie in (0, 1), got {}",
                    trim.at
                )));
            }
        }
        Ok(())
    }
}

/// Weights targeting `estimand` from propensity scores.
pub fn ipw_weights(scores: &[f64], treated: &[bool], estimand: Estimand) -> Vec<f64> {
    scores
        .iter()
        .zip(treated)
        .map(|(&p, &t)| match (estimand, t) {
            (Estimand::Att, true) => 1.0,
            (Estimand::Att, false) => p / (1.0 - p),
            (Estimand::Ate, true) => 1.0 / p,
            (Estimand::Ate, false) => 1.0 / (1.0 - p),
            (Estimand::Atc, true) => (1.0 - p) / p,
            (Estimand::Atc, false) => 1.0,
        })
        .collect()
}

/// Sample quantile using linear interpolation between order statistics (R type 7).
pub fn quantile(values: &[f64], prob: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let h = (sorted.len() - 1) as f64 * prob;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Trim weights; for ATT/ATC only the non-focal group is trimmed.
pub fn trim_weights(
    weights: &[f64],
    treated: &[bool],
    estimand: Estimand,
    trim: &TrimConfig,
) -> Vec<f64> {
    let at = if trim.at < 0.5 { 1.0 - trim.at } else { trim.at };
    let in_scope = |t: bool| match estimand {
        Estimand::Att => !t,
        Estimand::Atc => t,
        Estimand::Ate => true,
    };
    let pool: Vec<f64> = weights
        .iter()
        .zip(treated)
        .filter(|(_, &t)| in_scope(t))
        .map(|(&w, _)| w)
        .collect();
    let upper = quantile(&pool, at);
    let lower = trim.lower.then(|| quantile(&pool, 1.0 - at));

    let mut trimmed_count = 0usize;
    let trimmed = weights
        .iter()
        .zip(treated)
        .map(|(&w, &t)| {
            if !in_scope(t) {
                return w;
            }
            let mut out = w.min(upper);
            if let Some(floor) = lower {
                out = out.max(floor);
            }
            if out != w {
                trimmed_count += 1;
            }
            out
        })
        .collect();
    info!(at, upper, lower = ?lower, trimmed = trimmed_count, "trimmed weights");
    trimmed
}

/// Full weighting step: estimand weights then optional trimming.
pub fn estimate_weights(
    scores: &[f64],
    treated: &[bool],
    config: &WeightingConfig,
) -> Result<Vec<f64>> {
    config.validate()?;
    let weights = ipw_weights(scores, treated, config.estimand);
    if let Some(row) = weights.iter().position(|w| !w.is_finite()) {
        return Err(CausalError::ModelFit(format!(
            "non-finite weight at row {row} (propensity {})",
            scores[row]
        )));
    }
    Ok(match &config.trim {
        Some(trim) => trim_weights(&weights, treated, config.estimand, trim),
        None => weights,
    })
}
