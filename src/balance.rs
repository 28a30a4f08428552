//! Covariate balance before and after matching/weighting.

use polars::prelude::{DataFrame, NamedFrom, Series};
use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::info;

use crate::{
    data::records::Column,
    error::{CausalError, Result},
    propensity::Estimand,
    weights::compose::WeightedRecordSet,
};

/// Conventional threshold for a meaningful standardized difference.
pub const IMBALANCE_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceRow {
    pub covariate: String,
    /// Level for categorical covariates; `None` for numeric ones.
    pub level: Option<String>,
    pub mean_treated_before: f64,
    pub mean_control_before: f64,
    pub smd_before: f64,
    pub mean_treated_after: f64,
    pub mean_control_after: f64,
    pub smd_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceTable {
    pub estimand: Estimand,
    pub rows: Vec<BalanceRow>,
}

fn mean(values: &[f64], weights: impl Iterator<Item = f64>) -> f64 {
    let (sum, total) = values
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(s, t), (&v, w)| (s + w * v, t + w));
    if total > 0.0 {
        sum / total
    } else {
        f64::NAN
    }
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.variance()
}

fn smd(treated: f64, control: f64, scale: f64) -> f64 {
    let diff = treated - control;
    if scale > 0.0 {
        diff / scale
    } else if diff == 0.0 {
        0.0
    } else {
        f64::NAN
    }
}

/// Expand covariates into (name, level, values) features.
fn features(set: &WeightedRecordSet, covariates: &[String]) -> Result<Vec<(String, Option<String>, Vec<f64>)>> {
    let mut out = Vec::new();
    for name in covariates {
        match set.records().column(name)? {
            Column::Numeric(values) => out.push((name.clone(), None, values.clone())),
            Column::Categorical(factor) => {
                for (code, level) in factor.levels().iter().enumerate() {
                    let values = factor
                        .codes()
                        .iter()
                        .map(|&c| if c == code { 1.0 } else { 0.0 })
                        .collect();
                    out.push((name.clone(), Some(level.clone()), values));
                }
            }
        }
    }
    Ok(out)
}

/// Standardized mean differences, unweighted and with final weights.
///
/// The scale is the unweighted SD of the treated (ATT), control (ATC) or
/// both arms pooled (ATE).
pub fn assess(set: &WeightedRecordSet, covariates: &[String], estimand: Estimand) -> Result<BalanceTable> {
    let treated = set.treated();
    let weights = set.final_weights();
    let mut rows = Vec::new();
    for (covariate, level, values) in features(set, covariates)? {
        let arm = |want: bool| -> Vec<f64> {
            values
                .iter()
                .zip(treated)
                .filter(|(_, &t)| t == want)
                .map(|(&v, _)| v)
                .collect()
        };
        let (t_values, c_values) = (arm(true), arm(false));
        let scale = match estimand {
            Estimand::Att => sample_variance(&t_values).sqrt(),
            Estimand::Atc => sample_variance(&c_values).sqrt(),
            Estimand::Ate => ((sample_variance(&t_values) + sample_variance(&c_values)) / 2.0).sqrt(),
        };
        let unit = |want: bool| treated.iter().map(move |&t| if t == want { 1.0 } else { 0.0 });
        let weighted = |want: bool| {
            treated
                .iter()
                .zip(weights)
                .map(move |(&t, &w)| if t == want { w } else { 0.0 })
        };
        let mean_treated_before = mean(&values, unit(true));
        let mean_control_before = mean(&values, unit(false));
        let mean_treated_after = mean(&values, weighted(true));
        let mean_control_after = mean(&values, weighted(false));
        rows.push(BalanceRow {
            covariate,
            level,
            mean_treated_before,
            mean_control_before,
            smd_before: smd(mean_treated_before, mean_control_before, scale),
            mean_treated_after,
            mean_control_after,
            smd_after: smd(mean_treated_after, mean_control_after, scale),
        });
    }
    let table = BalanceTable { estimand, rows };
    info!(
        max_abs_smd_after = table.max_abs_smd_after(),
        imbalanced = table.imbalanced(IMBALANCE_THRESHOLD).len(),
        "balance assessed"
    );
    Ok(table)
}

/// Row-wise mean of balance tables from several imputations.
pub fn average(tables: &[BalanceTable]) -> Result<BalanceTable> {
    let Some(first) = tables.first() else {
        return Err(CausalError::EmptyPool);
    };
    for table in &tables[1..] {
        let aligned = table.rows.len() == first.rows.len()
            && table
                .rows
                .iter()
                .zip(&first.rows)
                .all(|(a, b)| a.covariate == b.covariate && a.level == b.level);
        if !aligned {
            return Err(CausalError::InconsistentImputations(
                "balance tables cover different covariates or levels".to_string(),
            ));
        }
    }
    let m = tables.len() as f64;
    let avg = |idx: usize, field: fn(&BalanceRow) -> f64| -> f64 {
        tables.iter().map(|t| field(&t.rows[idx])).sum::<f64>() / m
    };
    let rows = first
        .rows
        .iter()
        .enumerate()
        .map(|(idx, row)| BalanceRow {
            covariate: row.covariate.clone(),
            level: row.level.clone(),
            mean_treated_before: avg(idx, |r| r.mean_treated_before),
            mean_control_before: avg(idx, |r| r.mean_control_before),
            smd_before: avg(idx, |r| r.smd_before),
            mean_treated_after: avg(idx, |r| r.mean_treated_after),
            mean_control_after: avg(idx, |r| r.mean_control_after),
            smd_after: avg(idx, |r| r.smd_after),
        })
        .collect();
    Ok(BalanceTable {
        estimand: first.estimand,
        rows,
    })
}

impl BalanceTable {
    pub fn max_abs_smd_after(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.smd_after.abs())
            .filter(|v| v.is_finite())
            .fold(0.0, f64::max)
    }

    /// Rows whose weighted |SMD| exceeds `threshold`.
    pub fn imbalanced(&self, threshold: f64) -> Vec<&BalanceRow> {
        self.rows
            .iter()
            .filter(|r| r.smd_after.abs() > threshold)
            .collect()
    }

    pub fn to_frame(&self) -> Result<DataFrame> {
        let col = |f: fn(&BalanceRow) -> f64| self.rows.iter().map(f).collect::<Vec<_>>();
        Ok(DataFrame::new(vec![
            Series::new(
                "covariate".into(),
                self.rows.iter().map(|r| r.covariate.clone()).collect::<Vec<_>>(),
            ),
            Series::new(
                "level".into(),
                self.rows.iter().map(|r| r.level.clone()).collect::<Vec<_>>(),
            ),
            Series::new("mean_treated_before".into(), col(|r| r.mean_treated_before)),
            Series::new("mean_control_before".into(), col(|r| r.mean_control_before)),
            Series::new("smd_before".into(), col(|r| r.smd_before)),
            Series::new("mean_treated_after".into(), col(|r| r.mean_treated_after)),
            Series::new("mean_control_after".into(), col(|r| r.mean_control_after)),
            Series::new("smd_after".into(), col(|r| r.smd_after)),
        ])?)
    }
}
