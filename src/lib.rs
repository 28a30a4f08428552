//! Propensity matching/weighting, raking to external marginals and Rubin
//! pooling across multiply-imputed real-world cohorts.

pub mod balance;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod outcome;
pub mod pipeline;
pub mod pooling;
pub mod propensity;
pub mod weights;

pub use error::{CausalError, ErrorKind, Result};
