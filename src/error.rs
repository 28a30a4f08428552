//! Error taxonomy shared by every analysis layer.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used by the run report and the failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Convergence,
    DataSufficiency,
    Consistency,
    Model,
    Io,
}

#[derive(Debug, Error)]
pub enum CausalError {
    #[error("missing column `{0}`")]
    MissingColumn(String),

    #[error("column `{column}` has {got} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        got: usize,
    },

    #[error("column `{0}` is not categorical")]
    NotCategorical(String),

    #[error("column `{column}` is not a binary 0/1 indicator: {reason}")]
    NotBinary { column: String, reason: String },

    #[error("duplicate caseid {0}")]
    DuplicateCaseId(i64),

    #[error("column `{column}` has a missing value in imputation {imputation}")]
    IncompleteData { column: String, imputation: usize },

    #[error("invalid target distribution for `{covariate}`: {reason}")]
    InvalidTarget { covariate: String, reason: String },

    #[error(
        "target levels for `{covariate}` do not match the data \
         (absent from targets: {missing_in_targets:?}, absent from data: {missing_in_data:?})"
    )]
    TargetSpecMismatch {
        covariate: String,
        missing_in_targets: Vec<String>,
        missing_in_data: Vec<String>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("propensity model failed to fit: {0}")]
    ModelFit(String),

    #[error("outcome model failed to fit: {0}")]
    OutcomeFit(String),

    #[error("raking did not converge after {iterations} rounds (max deviation {max_deviation:.3e})")]
    NonConvergence { iterations: usize, max_deviation: f64 },

    #[error("level `{level}` of `{covariate}` has target {target} but zero weight among eligible records")]
    EmptyLevel {
        covariate: String,
        level: String,
        target: f64,
    },

    #[error("no records are eligible for raking")]
    NoEligibleRecords,

    #[error("no units could be matched ({focal} focal units, {candidates} candidates)")]
    NoMatches { focal: usize, candidates: usize },

    #[error("imputations are inconsistent: {0}")]
    InconsistentImputations(String),

    #[error("imputation {imputation} failed: {source}")]
    ImputationFailed {
        imputation: usize,
        #[source]
        source: Box<CausalError>,
    },

    #[error("pooling requires at least one estimate")]
    EmptyPool,

    #[error("refusing to pool {available} of {expected} imputations without acknowledgement")]
    PartialPooling { available: usize, expected: usize },

    #[error(transparent)]
    Polars(#[from] polars::error::PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CausalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingColumn(_)
            | Self::LengthMismatch { .. }
            | Self::NotCategorical(_)
            | Self::NotBinary { .. }
            | Self::DuplicateCaseId(_)
            | Self::InvalidTarget { .. }
            | Self::TargetSpecMismatch { .. }
            | Self::InvalidConfig(_) => ErrorKind::Configuration,
            Self::NonConvergence { .. } => ErrorKind::Convergence,
            Self::EmptyLevel { .. }
            | Self::NoEligibleRecords
            | Self::NoMatches { .. }
            | Self::EmptyPool
            | Self::PartialPooling { .. } => ErrorKind::DataSufficiency,
            Self::IncompleteData { .. } | Self::InconsistentImputations(_) => {
                ErrorKind::Consistency
            }
            Self::ModelFit(_) | Self::OutcomeFit(_) => ErrorKind::Model,
            Self::ImputationFailed { source, .. } => source.kind(),
            Self::Polars(_) | Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Attach the 1-based imputation number to an error raised while processing it.
    pub fn in_imputation(self, imputation: usize) -> Self {
        match self {
            already @ Self::ImputationFailed { .. } => already,
            other => Self::ImputationFailed {
                imputation,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CausalError>;
