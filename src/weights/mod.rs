//! Raking to external marginals and final weight composition.

pub mod compose;
pub mod raking;
pub mod targets;

pub use compose::{compose, WeightedRecordSet};
pub use raking::{
    rake, rake_within_groups, ConvergencePolicy, RakingConfig, RakingOutcome, RakingScope,
    RakingStatus,
};
pub use targets::TargetDistributions;
