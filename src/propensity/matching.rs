//! Greedy nearest-neighbour matching on the propensity distance.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::{
    error::{CausalError, Result},
    propensity::{DataWarning, Estimand},
};

/// Scale on which distances between units are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    #[default]
    Propensity,
    /// Log-odds of the propensity score.
    Logit,
}

impl Distance {
    pub fn transform(self, score: f64) -> f64 {
        match self {
            Self::Propensity => score,
            Self::Logit => (score / (1.0 - score)).ln(),
        }
    }
}

/// Order in which focal units pick their matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrder {
    #[default]
    Largest,
    Smallest,
    Data,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub distance: Distance,
    /// Non-focal units per focal unit.
    pub ratio: usize,
    /// Maximum allowed distance; `None` disables the caliper.
    pub caliper: Option<f64>,
    /// Interpret the caliper in standard deviations of the distance.
    pub std_caliper: bool,
    pub replace: bool,
    pub order: MatchOrder,
    pub estimand: Estimand,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            distance: Distance::Propensity,
            ratio: 1,
            caliper: None,
            std_caliper: true,
            replace: false,
            order: MatchOrder::Largest,
            estimand: Estimand::Att,
        }
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ratio == 0 {
            return Err(CausalError::InvalidConfig("matching ratio must be >= 1".into()));
        }
        if let Some(caliper) = self.caliper {
            if !(caliper.is_finite() && caliper > 0.0) {
                return Err(CausalError::InvalidConfig(format!(
                    "caliper must be positive, got {caliper}"
                )));
            }
        }
        if self.estimand == Estimand::Ate {
            return Err(CausalError::InvalidConfig(
                "nearest-neighbour matching supports ATT or ATC only".into(),
            ));
        }
        Ok(())
    }
}

/// Matching outcome aligned with the input rows.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub weights: Vec<f64>,
    /// Match group per row; `None` for unmatched rows or matching with replacement.
    pub subclass: Vec<Option<usize>>,
    /// Focal row and the non-focal rows matched to it.
    pub pairs: Vec<(usize, Vec<usize>)>,
    pub warnings: Vec<DataWarning>,
}

fn sample_sd(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.std_dev()
}

/// Closest available candidate to `target` within `caliper`; ties go to the lowest row.
fn nearest_available(
    target: f64,
    candidates: &[usize],
    distance: &[f64],
    available: &[bool],
    caliper: Option<f64>,
) -> Option<usize> {
    let split = candidates.partition_point(|&row| distance[row] < target);
    let mut best: Option<(f64, usize)> = None;
    let beyond = |gap: f64| caliper.is_some_and(|width| gap > width);
    let better = |gap: f64, row: usize, best: &Option<(f64, usize)>| match best {
        None => true,
        Some((best_gap, best_row)) => gap < *best_gap || (gap == *best_gap && row < *best_row),
    };

    for &row in candidates[split..].iter() {
        let gap = distance[row] - target;
        if best.is_some_and(|(best_gap, _)| gap > best_gap) || beyond(gap) {
            break;
        }
        if available[row] && better(gap, row, &best) {
            best = Some((gap, row));
        }
    }
    for &row in candidates[..split].iter().rev() {
        let gap = target - distance[row];
        if best.is_some_and(|(best_gap, _)| gap > best_gap) || beyond(gap) {
            break;
        }
        if available[row] && better(gap, row, &best) {
            best = Some((gap, row));
        }
    }

    best.map(|(_, row)| row)
}

/// Match focal units (treated for ATT, controls for ATC) to their nearest neighbours.
pub fn nearest_neighbor(
    distance: &[f64],
    treated: &[bool],
    config: &MatchingConfig,
    seed: u64,
) -> Result<MatchOutcome> {
    config.validate()?;
    let n = distance.len();
    let focal_is_treated = config.estimand != Estimand::Atc;
    let (mut focal, mut candidates): (Vec<usize>, Vec<usize>) =
        (0..n).partition(|&row| treated[row] == focal_is_treated);

    let mut warnings = Vec::new();
    if !config.replace && candidates.len() < focal.len() * config.ratio {
        warnings.push(DataWarning::InsufficientControls {
            focal: focal.len(),
            candidates: candidates.len(),
            ratio: config.ratio,
        });
    }

    let caliper = config.caliper.map(|c| {
        if config.std_caliper {
            c * sample_sd(distance)
        } else {
            c
        }
    });

    match config.order {
        MatchOrder::Largest => {
            focal.sort_by(|&a, &b| distance[b].total_cmp(&distance[a]).then(a.cmp(&b)))
        }
        MatchOrder::Smallest => {
            focal.sort_by(|&a, &b| distance[a].total_cmp(&distance[b]).then(a.cmp(&b)))
        }
        MatchOrder::Data => {}
        MatchOrder::Random => focal.shuffle(&mut StdRng::seed_from_u64(seed)),
    }
    candidates.sort_by(|&a, &b| distance[a].total_cmp(&distance[b]).then(a.cmp(&b)));

    let mut available = vec![true; n];
    let mut matches: Vec<Vec<usize>> = vec![Vec::new(); n];
    for _pass in 0..config.ratio {
        for &unit in &focal {
            if let Some(partner) =
                nearest_available(distance[unit], &candidates, distance, &available, caliper)
            {
                if !config.replace {
                    available[partner] = false;
                }
                matches[unit].push(partner);
            }
        }
    }

    let mut weights = vec![0.0; n];
    let mut pairs = Vec::new();
    for row in 0..n {
        if treated[row] != focal_is_treated || matches[row].is_empty() {
            continue;
        }
        weights[row] = 1.0;
        let share = 1.0 / matches[row].len() as f64;
        for &partner in &matches[row] {
            weights[partner] += share;
        }
        pairs.push((row, matches[row].clone()));
    }
    if pairs.is_empty() {
        return Err(CausalError::NoMatches {
            focal: focal.len(),
            candidates: candidates.len(),
        });
    }

    let matched_candidates: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&row| weights[row] > 0.0)
        .collect();
    let total: f64 = matched_candidates.iter().map(|&row| weights[row]).sum();
    let scale = matched_candidates.len() as f64 / total;
    for &row in &matched_candidates {
        weights[row] *= scale;
    }

    let unmatched = focal.len() - pairs.len();
    if unmatched > 0 {
        warnings.push(DataWarning::UnmatchedFocal {
            count: unmatched,
            focal: focal.len(),
        });
    }

    let mut subclass = vec![None; n];
    if !config.replace {
        for (group, (unit, partners)) in pairs.iter().enumerate() {
            subclass[*unit] = Some(group + 1);
            for &partner in partners {
                subclass[partner] = Some(group + 1);
            }
        }
    }

    info!(
        focal = focal.len(),
        matched_focal = pairs.len(),
        matched_candidates = matched_candidates.len(),
        caliper = ?caliper,
        "nearest-neighbour matching complete"
    );
    debug!(unmatched, "unmatched focal units");
    Ok(MatchOutcome {
        weights,
        subclass,
        pairs,
        warnings,
    })
}
