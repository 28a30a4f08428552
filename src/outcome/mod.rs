//! Outcome models fitted once per imputed dataset.

pub mod cox;

pub use cox::{CoxConfig, CoxFit, CoxModel, SurvivalData, Ties};
