//! Weighted Cox proportional hazards with cluster-robust variance.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::error::{CausalError, Result};

const MAX_HALVINGS: usize = 30;

/// Ties approximation for the partial likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ties {
    #[default]
    Efron,
    Breslow,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoxConfig {
    pub ties: Ties,
    pub max_iterations: usize,
    /// Relative change in log partial likelihood that ends the iteration.
    pub tolerance: f64,
}

impl Default for CoxConfig {
    fn default() -> Self {
        Self {
            ties: Ties::Efron,
            max_iterations: 30,
            tolerance: 1e-9,
        }
    }
}

/// Right-censored survival data with case weights and optional clusters.
#[derive(Debug, Clone)]
pub struct SurvivalData {
    time: Vec<f64>,
    event: Vec<bool>,
    weights: Vec<f64>,
    covariates: Vec<(String, Vec<f64>)>,
    clusters: Option<Vec<i64>>,
}

impl SurvivalData {
    pub fn new(time: Vec<f64>, event: Vec<bool>, weights: Vec<f64>) -> Result<Self> {
        let n = time.len();
        for (column, got) in [("event", event.len()), ("weights", weights.len())] {
            if got != n {
                return Err(CausalError::LengthMismatch {
                    column: column.to_string(),
                    expected: n,
                    got,
                });
            }
        }
        if let Some(t) = time.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
            return Err(CausalError::OutcomeFit(format!(
                "survival times must be finite and non-negative, found {t}"
            )));
        }
        if let Some(w) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
            return Err(CausalError::OutcomeFit(format!(
                "case weights must be finite and non-negative, found {w}"
            )));
        }
        Ok(Self {
            time,
            event,
            weights,
            covariates: Vec::new(),
            clusters: None,
        })
    }

    pub fn with_covariate(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        let name = name.into();
        if values.len() != self.time.len() {
            return Err(CausalError::LengthMismatch {
                column: name,
                expected: self.time.len(),
                got: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CausalError::OutcomeFit(format!(
                "covariate `{name}` has non-finite values"
            )));
        }
        self.covariates.push((name, values));
        Ok(self)
    }

    /// Group rows for the sandwich variance; rows sharing a label form one cluster.
    pub fn with_clusters(mut self, clusters: Vec<i64>) -> Result<Self> {
        if clusters.len() != self.time.len() {
            return Err(CausalError::LengthMismatch {
                column: "cluster".to_string(),
                expected: self.time.len(),
                got: clusters.len(),
            });
        }
        self.clusters = Some(clusters);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoxCoefficient {
    pub name: String,
    /// Log hazard ratio.
    pub estimate: f64,
    /// Robust SE when clusters were given, model-based SE otherwise.
    pub std_error: f64,
    pub naive_se: f64,
    pub robust_se: Option<f64>,
    pub hazard_ratio: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoxFit {
    pub coefficients: Vec<CoxCoefficient>,
    pub loglik: f64,
    pub loglik_null: f64,
    pub iterations: usize,
    /// Rows with positive weight.
    pub n: usize,
    pub n_events: usize,
    pub clusters: Option<usize>,
}

impl CoxFit {
    pub fn coefficient(&self, name: &str) -> Option<&CoxCoefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

/// Positive-weight rows sorted by descending time, covariates centred.
struct Prepared {
    n: usize,
    p: usize,
    event: Vec<bool>,
    weight: Vec<f64>,
    x: DMatrix<f64>,
    cluster: Vec<usize>,
    n_clusters: usize,
    groups: Vec<(usize, usize)>,
}

impl Prepared {
    fn new(data: &SurvivalData) -> Result<Self> {
        let p = data.covariates.len();
        if p == 0 {
            return Err(CausalError::OutcomeFit(
                "at least one covariate is required".to_string(),
            ));
        }
        let mut order: Vec<usize> = (0..data.len()).filter(|&i| data.weights[i] > 0.0).collect();
        order.sort_by(|&i, &j| data.time[j].total_cmp(&data.time[i]).then(i.cmp(&j)));
        let n = order.len();
        if !order.iter().any(|&i| data.event[i]) {
            return Err(CausalError::OutcomeFit(
                "no events among positively weighted rows".to_string(),
            ));
        }

        let mut x = DMatrix::from_fn(n, p, |r, j| data.covariates[j].1[order[r]]);
        for mut column in x.column_iter_mut() {
            let mean = column.mean();
            column.add_scalar_mut(-mean);
        }

        let mut groups = Vec::new();
        let mut start = 0;
        for k in 1..=n {
            if k == n || data.time[order[k]] != data.time[order[start]] {
                groups.push((start, k));
                start = k;
            }
        }

        let (cluster, n_clusters) = match &data.clusters {
            Some(labels) => {
                let mut ids: HashMap<i64, usize> = HashMap::new();
                let cluster = order
                    .iter()
                    .map(|&i| {
                        let next = ids.len();
                        *ids.entry(labels[i]).or_insert(next)
                    })
                    .collect();
                (cluster, ids.len())
            }
            None => ((0..n).collect(), n),
        };

        Ok(Self {
            n,
            p,
            event: order.iter().map(|&i| data.event[i]).collect(),
            weight: order.iter().map(|&i| data.weights[i]).collect(),
            x,
            cluster,
            n_clusters,
            groups,
        })
    }

    fn row(&self, i: usize) -> DVector<f64> {
        self.x.row(i).transpose()
    }
}

/// Per death-time hazard pieces used by the score residuals.
struct TimeHazard {
    start: usize,
    end: usize,
    /// Sum of hazard increments (and increments times mean covariate) for survivors.
    at_risk: (f64, DVector<f64>),
    /// Same sums with the tied-death discount applied.
    dying: (f64, DVector<f64>),
    mean_x: DVector<f64>,
}

struct Evaluation {
    loglik: f64,
    score: DVector<f64>,
    info: DMatrix<f64>,
    risk: DVector<f64>,
    hazards: Vec<TimeHazard>,
}

#[derive(Debug, Clone)]
pub struct CoxModel {
    config: CoxConfig,
}

impl Default for CoxModel {
    fn default() -> Self {
        Self::new(CoxConfig::default())
    }
}

impl CoxModel {
    pub fn new(config: CoxConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self, data: &SurvivalData) -> Result<CoxFit> {
        let prepared = Prepared::new(data)?;
        let p = prepared.p;

        let mut beta = DVector::<f64>::zeros(p);
        let mut current = self.evaluate(&prepared, &beta)?;
        let loglik_null = current.loglik;
        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.config.max_iterations {
            iterations += 1;
            let step = invert(&current.info)? * &current.score;
            let mut candidate = &beta + step;
            let mut next = self.evaluate(&prepared, &candidate);
            let mut halvings = 0;
            while !matches!(&next, Ok(e) if e.loglik >= current.loglik) {
                if halvings == MAX_HALVINGS {
                    return Err(CausalError::OutcomeFit(
                        "step halving failed to improve the partial likelihood".to_string(),
                    ));
                }
                candidate = (&beta + &candidate) * 0.5;
                next = self.evaluate(&prepared, &candidate);
                halvings += 1;
            }
            let next = next?;
            let change = (1.0 - current.loglik / next.loglik).abs();
            beta = candidate;
            current = next;
            if change <= self.config.tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(CausalError::OutcomeFit(format!(
                "Newton-Raphson did not converge in {iterations} iterations"
            )));
        }

        let inverse = invert(&current.info)?;
        let robust = data
            .clusters
            .as_ref()
            .map(|_| sandwich(&prepared, &current, &inverse));

        let normal = Normal::new(0.0, 1.0)
            .map_err(|err| CausalError::OutcomeFit(format!("standard normal: {err}")))?;
        let coefficients = data
            .covariates
            .iter()
            .enumerate()
            .map(|(j, (name, _))| {
                let naive_se = inverse[(j, j)].sqrt();
                let robust_se = robust.as_ref().map(|v| v[(j, j)].sqrt());
                let std_error = robust_se.unwrap_or(naive_se);
                let z = beta[j] / std_error;
                CoxCoefficient {
                    name: name.clone(),
                    estimate: beta[j],
                    std_error,
                    naive_se,
                    robust_se,
                    hazard_ratio: beta[j].exp(),
                    z,
                    p_value: 2.0 * (1.0 - normal.cdf(z.abs())),
                }
            })
            .collect();

        let n_events = prepared.event.iter().filter(|&&e| e).count();
        debug!(
            iterations,
            loglik = current.loglik,
            n = prepared.n,
            n_events,
            "cox model converged"
        );
        Ok(CoxFit {
            coefficients,
            loglik: current.loglik,
            loglik_null,
            iterations,
            n: prepared.n,
            n_events,
            clusters: data.clusters.as_ref().map(|_| prepared.n_clusters),
        })
    }

    fn evaluate(&self, data: &Prepared, beta: &DVector<f64>) -> Result<Evaluation> {
        let p = data.p;
        let risk = (&data.x * beta).map(f64::exp);
        if risk.iter().any(|r| !r.is_finite()) {
            return Err(CausalError::OutcomeFit(
                "linear predictor overflowed".to_string(),
            ));
        }

        let mut loglik = 0.0;
        let mut score = DVector::<f64>::zeros(p);
        let mut info = DMatrix::<f64>::zeros(p, p);
        let mut hazards = Vec::new();

        // Risk-set sums grow as time decreases.
        let mut denom = 0.0;
        let mut a = DVector::<f64>::zeros(p);
        let mut cmat = DMatrix::<f64>::zeros(p, p);

        for &(start, end) in &data.groups {
            let mut deaths = 0usize;
            let mut dead_weight = 0.0;
            let mut denom2 = 0.0;
            let mut a2 = DVector::<f64>::zeros(p);
            let mut cmat2 = DMatrix::<f64>::zeros(p, p);
            for i in start..end {
                let wr = data.weight[i] * risk[i];
                let row = data.row(i);
                let outer = &row * row.transpose();
                denom += wr;
                a.axpy(wr, &row, 1.0);
                cmat += &outer * wr;
                if data.event[i] {
                    deaths += 1;
                    dead_weight += data.weight[i];
                    denom2 += wr;
                    a2.axpy(wr, &row, 1.0);
                    cmat2 += outer * wr;
                    loglik += data.weight[i] * row.dot(beta);
                    score.axpy(data.weight[i], &row, 1.0);
                }
            }
            if deaths == 0 {
                continue;
            }

            let substeps = match self.config.ties {
                Ties::Efron => deaths,
                Ties::Breslow => 1,
            };
            let mean_weight = dead_weight / substeps as f64;
            let mut at_risk = (0.0, DVector::<f64>::zeros(p));
            let mut dying = (0.0, DVector::<f64>::zeros(p));
            let mut mean_x = DVector::<f64>::zeros(p);
            for r in 0..substeps {
                let discount = r as f64 / substeps as f64;
                let d2 = denom - discount * denom2;
                if !(d2 > 0.0) {
                    return Err(CausalError::OutcomeFit(
                        "empty risk set at an event time".to_string(),
                    ));
                }
                let xbar = (&a - &a2 * discount) / d2;
                let c = (&cmat - &cmat2 * discount) / d2;
                loglik -= mean_weight * d2.ln();
                score.axpy(-mean_weight, &xbar, 1.0);
                info += (c - &xbar * xbar.transpose()) * mean_weight;

                let hazard = mean_weight / d2;
                at_risk.0 += hazard;
                dying.0 += (1.0 - discount) * hazard;
                at_risk.1.axpy(hazard, &xbar, 1.0);
                dying.1.axpy((1.0 - discount) * hazard, &xbar, 1.0);
                mean_x.axpy(1.0 / substeps as f64, &xbar, 1.0);
            }
            hazards.push(TimeHazard {
                start,
                end,
                at_risk,
                dying,
                mean_x,
            });
        }

        if !loglik.is_finite() {
            return Err(CausalError::OutcomeFit(
                "partial likelihood is not finite".to_string(),
            ));
        }
        Ok(Evaluation {
            loglik,
            score,
            info,
            risk,
            hazards,
        })
    }
}

fn invert(info: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    info.clone()
        .try_inverse()
        .ok_or_else(|| CausalError::OutcomeFit("information matrix is singular".to_string()))
}

/// Cluster-summed score residual sandwich `I⁻¹ (Σ_g U_g U_gᵀ) I⁻¹`.
fn sandwich(data: &Prepared, eval: &Evaluation, inverse: &DMatrix<f64>) -> DMatrix<f64> {
    let p = data.p;
    let mut per_cluster = DMatrix::<f64>::zeros(data.n_clusters, p);

    // Hazards are stored by descending time; walk them ascending and carry
    // the cumulative sums over strictly earlier event times.
    let mut cum0 = 0.0;
    let mut cum1 = DVector::<f64>::zeros(p);
    let by_start: HashMap<usize, &TimeHazard> =
        eval.hazards.iter().map(|h| (h.start, h)).collect();
    for &(start, end) in data.groups.iter().rev() {
        let here = by_start.get(&start).copied();
        for i in start..end {
            let row = data.row(i);
            let (mut h0, mut h1) = (cum0, cum1.clone());
            let mut own = DVector::<f64>::zeros(p);
            if let Some(h) = here {
                debug_assert_eq!(h.end, end);
                let (g0, g1) = if data.event[i] { &h.dying } else { &h.at_risk };
                h0 += g0;
                h1 += g1;
                if data.event[i] {
                    own = &row - &h.mean_x;
                }
            }
            let residual = (own - (&row * h0 - h1) * eval.risk[i]) * data.weight[i];
            let mut target = per_cluster.row_mut(data.cluster[i]);
            target += residual.transpose();
        }
        if let Some(h) = here {
            cum0 += h.at_risk.0;
            cum1 += &h.at_risk.1;
        }
    }

    let meat = per_cluster.transpose() * &per_cluster;
    inverse * meat * inverse
}
