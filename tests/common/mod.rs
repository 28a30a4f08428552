#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use rwe_causal::{
    data::{Column, Factor, ImputedDatasets, RecordSet},
    propensity::{
        matching::MatchingConfig, FittedPropensity, Mode, ModelSpec, PropensityFitter,
    },
    weights::TargetDistributions,
    Result,
};

pub const CASEIDS: [i64; 9] = [105, 101, 108, 103, 102, 107, 104, 106, 109];
pub const TREAT: [f64; 9] = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0];
pub const PS: [f64; 9] = [0.60, 0.58, 0.40, 0.41, 0.70, 0.69, 0.28, 0.30, 0.05];
/// F = 0, M = 1
pub const SEX: [usize; 9] = [0, 0, 1, 1, 0, 1, 0, 1, 0];
/// A = 0, B = 1
pub const SITE: [usize; 9] = [0, 0, 0, 0, 1, 1, 1, 1, 1];

/// Nine records; nearest-neighbour matching pairs rows (0,1) (2,3) (4,5) (7,6)
/// and leaves row 8 unmatched.
pub fn cohort(ps: &[f64]) -> RecordSet {
    RecordSet::new(CASEIDS.to_vec())
        .unwrap()
        .with_column("treat", Column::Numeric(TREAT.to_vec()))
        .unwrap()
        .with_column("ps", Column::Numeric(ps.to_vec()))
        .unwrap()
        .with_column(
            "sex",
            Column::Categorical(Factor::new(vec!["F".into(), "M".into()], SEX.to_vec()).unwrap()),
        )
        .unwrap()
        .with_column(
            "site",
            Column::Categorical(Factor::new(vec!["A".into(), "B".into()], SITE.to_vec()).unwrap()),
        )
        .unwrap()
}

/// Treated far from every control: nothing matches within a tight caliper.
pub fn separated() -> RecordSet {
    let ps: Vec<f64> = TREAT.iter().map(|&t| if t == 1.0 { 0.9 } else { 0.1 }).collect();
    cohort(&ps)
}

pub fn imputations(n: usize) -> ImputedDatasets {
    ImputedDatasets::new((0..n).map(|_| cohort(&PS)).collect()).unwrap()
}

pub fn spec() -> ModelSpec {
    ModelSpec::new("treat", ["ps", "sex"])
}

pub fn matching() -> Mode {
    Mode::Matching(MatchingConfig {
        std_caliper: false,
        ..MatchingConfig::default()
    })
}

pub fn sex_targets() -> TargetDistributions {
    TargetDistributions::new().with_target("sex", [("F", 0.6), ("M", 0.4)])
}

/// Uses the `ps` column as the fitted propensity score.
#[derive(Debug, Default)]
pub struct ColumnScores {
    pub fits: AtomicUsize,
}

impl ColumnScores {
    pub fn fits(&self) -> usize {
        self.fits.load(Ordering::SeqCst)
    }
}

impl PropensityFitter for ColumnScores {
    fn fit(&self, records: &RecordSet, _spec: &ModelSpec) -> Result<FittedPropensity> {
        self.fits.fetch_add(1, Ordering::SeqCst);
        Ok(FittedPropensity {
            intercept: 0.0,
            coefficients: Vec::new(),
            scores: records.numeric("ps")?.to_vec(),
            stratum: None,
        })
    }
}
