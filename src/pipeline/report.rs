//! Run-level report aggregating per-imputation outcomes.

use std::{fs::File, io::BufWriter, path::Path};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{CausalError, ErrorKind, Result},
    pipeline::orchestrator::FailurePolicy,
    propensity::DataWarning,
    weights::{compose::WeightedRecordSet, raking::RakingStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputationStatus {
    Succeeded,
    /// Completed, but with data sufficiency warnings or unconverged raking.
    Warned,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StratumSeed {
    pub stratum: String,
    pub seed: u64,
}

/// Seeds actually used for one imputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UnitSeeds {
    Single(u64),
    /// One per stratum, in stratum order.
    Strata(Vec<StratumSeed>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputationReport {
    pub imputation: usize,
    pub seeds: UnitSeeds,
    pub status: ImputationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub warnings: Vec<DataWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raking: Option<RakingStatus>,
    pub retained_treated: usize,
    pub retained_control: usize,
    pub weight_total_treated: f64,
    pub weight_total_control: f64,
}

impl ImputationReport {
    pub(crate) fn success(imputation: usize, seeds: UnitSeeds, set: &WeightedRecordSet) -> Self {
        let (retained_treated, retained_control) = set.base().retained();
        let (weight_total_treated, weight_total_control) = set.weight_totals();
        let warnings = set.base().warnings.clone();
        let status = if warnings.is_empty() && (!set.is_raked() || set.raking().is_converged()) {
            ImputationStatus::Succeeded
        } else {
            ImputationStatus::Warned
        };
        Self {
            imputation,
            seeds,
            status,
            error_kind: None,
            reason: None,
            warnings,
            raking: Some(set.raking().clone()),
            retained_treated,
            retained_control,
            weight_total_treated,
            weight_total_control,
        }
    }

    pub(crate) fn failure(imputation: usize, seeds: UnitSeeds, error: &CausalError) -> Self {
        let cause = match error {
            CausalError::ImputationFailed { source, .. } => source.as_ref(),
            other => other,
        };
        Self {
            imputation,
            seeds,
            status: ImputationStatus::Failed,
            error_kind: Some(cause.kind()),
            reason: Some(cause.to_string()),
            warnings: Vec::new(),
            raking: None,
            retained_treated: 0,
            retained_control: 0,
            weight_total_treated: 0.0,
            weight_total_control: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<usize>,
    pub warned: Vec<usize>,
    pub failure_policy: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stratified_by: Option<String>,
    pub seed: u64,
    pub generated_at: DateTime<Utc>,
    pub imputations: Vec<ImputationReport>,
}

impl RunReport {
    pub(crate) fn new(
        mut imputations: Vec<ImputationReport>,
        failure_policy: FailurePolicy,
        stratified_by: Option<String>,
        seed: u64,
    ) -> Self {
        imputations.sort_by_key(|entry| entry.imputation);
        let indices = |status: ImputationStatus| -> Vec<usize> {
            imputations
                .iter()
                .filter(|entry| entry.status == status)
                .map(|entry| entry.imputation)
                .collect()
        };
        let failed = indices(ImputationStatus::Failed);
        let warned = indices(ImputationStatus::Warned);
        Self {
            total: imputations.len(),
            succeeded: imputations.len() - failed.len(),
            failed,
            warned,
            failure_policy,
            stratified_by,
            seed,
            generated_at: Utc::now(),
            imputations,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut line = format!("{} of {} imputations succeeded", self.succeeded, self.total);
        if !self.failed.is_empty() {
            line.push_str(&format!("; failed: {:?}", self.failed));
        }
        if !self.warned.is_empty() {
            line.push_str(&format!("; warnings: {:?}", self.warned));
        }
        line
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|err| CausalError::Io(std::io::Error::other(err)))
    }
}
