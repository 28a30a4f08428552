//! Combination of per-imputation estimates.

pub mod rubin;

pub use rubin::{pool, pool_with, Estimate, PooledEstimate, PoolingOptions};
