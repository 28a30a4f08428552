//! Final weight composition and propagation onto the full record set.

use crate::{
    data::records::RecordSet,
    error::{CausalError, Result},
    propensity::{MatchWeightResult, Mode},
    weights::raking::{RakingOutcome, RakingStatus},
};

/// Matched or weighted record set carrying one final weight per record.
#[derive(Debug, Clone)]
pub struct WeightedRecordSet {
    base: MatchWeightResult,
    final_weights: Vec<f64>,
    raking: RakingStatus,
}

/// Attach raking output to a base result.
///
/// Final weight is the raking weight for eligible records, zero for
/// ineligible ones, or the base weight when raking was not requested.
pub fn compose(base: MatchWeightResult, raking: RakingOutcome) -> Result<WeightedRecordSet> {
    if raking.weights.len() != base.len() {
        return Err(CausalError::LengthMismatch {
            column: "raking_weights".to_string(),
            expected: base.len(),
            got: raking.weights.len(),
        });
    }
    let final_weights = if raking.status.is_requested() {
        raking
            .weights
            .iter()
            .map(|w| w.unwrap_or(0.0))
            .collect()
    } else {
        base.base_weights.clone()
    };
    Ok(WeightedRecordSet {
        base,
        final_weights,
        raking: raking.status,
    })
}

impl WeightedRecordSet {
    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn records(&self) -> &RecordSet {
        &self.base.records
    }

    pub fn caseid(&self) -> &[i64] {
        self.base.records.caseid()
    }

    pub fn treated(&self) -> &[bool] {
        &self.base.treated
    }

    pub fn propensity(&self) -> &[f64] {
        &self.base.propensity
    }

    pub fn distance(&self) -> &[f64] {
        &self.base.distance
    }

    pub fn base_weights(&self) -> &[f64] {
        &self.base.base_weights
    }

    pub fn final_weights(&self) -> &[f64] {
        &self.final_weights
    }

    pub fn subclass(&self) -> &[Option<usize>] {
        &self.base.subclass
    }

    pub fn raking(&self) -> &RakingStatus {
        &self.raking
    }

    pub fn is_raked(&self) -> bool {
        self.raking.is_requested()
    }

    pub fn mode(&self) -> &Mode {
        &self.base.mode
    }

    pub fn base(&self) -> &MatchWeightResult {
        &self.base
    }

    /// Sum of final weights per arm (treated, control).
    pub fn weight_totals(&self) -> (f64, f64) {
        self.final_weights
            .iter()
            .zip(&self.base.treated)
            .fold((0.0, 0.0), |(t, c), (&w, &treated)| {
                if treated {
                    (t + w, c)
                } else {
                    (t, c + w)
                }
            })
    }

    /// Record which stratum the fitted propensity models belong to.
    pub(crate) fn tag_stratum(mut self, label: &str) -> Self {
        for model in &mut self.base.models {
            model.stratum = Some(label.to_string());
        }
        self
    }

    /// Reassemble stratum results into one set in the order of `full`.
    ///
    /// Every row of `full` must be covered by exactly one stratum. Match
    /// groups are renumbered so they stay unique across strata.
    pub fn from_strata(full: &RecordSet, parts: Vec<(Vec<usize>, WeightedRecordSet)>) -> Result<Self> {
        let n = full.len();
        let mut owner: Vec<Option<(usize, usize)>> = vec![None; n];
        for (part_idx, (rows, part)) in parts.iter().enumerate() {
            if rows.len() != part.len() {
                return Err(CausalError::InconsistentImputations(format!(
                    "stratum {part_idx} maps {} rows but holds {}",
                    rows.len(),
                    part.len()
                )));
            }
            for (local, &row) in rows.iter().enumerate() {
                if row >= n || part.caseid()[local] != full.caseid()[row] {
                    return Err(CausalError::InconsistentImputations(format!(
                        "stratum {part_idx} row {local} does not line up with the full record set"
                    )));
                }
                if owner[row].replace((part_idx, local)).is_some() {
                    return Err(CausalError::InconsistentImputations(format!(
                        "caseid {} appears in more than one stratum",
                        full.caseid()[row]
                    )));
                }
            }
        }
        if let Some(row) = owner.iter().position(Option::is_none) {
            return Err(CausalError::InconsistentImputations(format!(
                "caseid {} is not covered by any stratum",
                full.caseid()[row]
            )));
        }

        let mut offsets = Vec::with_capacity(parts.len());
        let mut next = 0usize;
        for (_, part) in &parts {
            offsets.push(next);
            next += part.subclass().iter().flatten().max().copied().unwrap_or(0);
        }

        let pick = |row: usize| -> (usize, usize) {
            owner[row].unwrap_or((0, 0))
        };
        let mut treated = Vec::with_capacity(n);
        let mut propensity = Vec::with_capacity(n);
        let mut distance = Vec::with_capacity(n);
        let mut base_weights = Vec::with_capacity(n);
        let mut subclass = Vec::with_capacity(n);
        let mut final_weights = Vec::with_capacity(n);
        for row in 0..n {
            let (p, local) = pick(row);
            let part = &parts[p].1;
            treated.push(part.treated()[local]);
            propensity.push(part.propensity()[local]);
            distance.push(part.distance()[local]);
            base_weights.push(part.base_weights()[local]);
            subclass.push(part.subclass()[local].map(|s| s + offsets[p]));
            final_weights.push(part.final_weights[local]);
        }

        let mut raking = RakingStatus::NotRequested;
        let mut models = Vec::new();
        let mut warnings = Vec::new();
        let mut mode = None;
        for (_, part) in parts {
            raking = raking.merge(part.raking);
            models.extend(part.base.models);
            warnings.extend(part.base.warnings);
            mode.get_or_insert(part.base.mode);
        }
        let mode = mode.ok_or_else(|| {
            CausalError::InconsistentImputations("no strata to combine".to_string())
        })?;

        Ok(Self {
            base: MatchWeightResult {
                records: full.clone(),
                treated,
                propensity,
                distance,
                base_weights,
                subclass,
                models,
                mode,
                warnings,
            },
            final_weights,
            raking,
        })
    }
}
