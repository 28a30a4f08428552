use proptest::prelude::*;
use rwe_causal::{
    data::records::{Column, Factor, RecordSet},
    error::{CausalError, ErrorKind},
    weights::{
        raking::{rake, ConvergencePolicy, RakingConfig, RakingStatus},
        targets::TargetDistributions,
    },
};

fn factor(levels: &[&str], codes: Vec<usize>) -> Column {
    Column::Categorical(
        Factor::new(levels.iter().map(|l| l.to_string()).collect(), codes).unwrap(),
    )
}

/// Two correlated binary covariates over eight records.
fn correlated() -> RecordSet {
    RecordSet::new((1..=8).collect())
        .unwrap()
        .with_column("a", factor(&["lo", "hi"], vec![0, 0, 0, 0, 1, 1, 1, 1]))
        .unwrap()
        .with_column("b", factor(&["x", "y"], vec![0, 0, 0, 1, 0, 1, 1, 1]))
        .unwrap()
}

fn targets() -> TargetDistributions {
    TargetDistributions::new()
        .with_target("a", [("lo", 0.3), ("hi", 0.7)])
        .with_target("b", [("x", 0.6), ("y", 0.4)])
}

fn proportion(codes: &[usize], weights: &[Option<f64>], level: usize) -> f64 {
    let total: f64 = weights.iter().flatten().sum();
    let hit: f64 = codes
        .iter()
        .zip(weights)
        .filter(|&(&c, _)| c == level)
        .filter_map(|(_, w)| *w)
        .sum();
    hit / total
}

#[test]
fn raked_marginals_hit_targets() {
    let records = correlated();
    let base = vec![1.0; 8];
    let eligible = vec![true; 8];
    let out = rake(&records, Some(&targets()), &base, &eligible, &RakingConfig::default()).unwrap();

    assert!(out.converged());
    assert!(out.iterations() >= 1);
    let a = records.factor("a").unwrap();
    let b = records.factor("b").unwrap();
    assert!((proportion(a.codes(), &out.weights, 1) - 0.7).abs() < 1e-6);
    assert!((proportion(b.codes(), &out.weights, 0) - 0.6).abs() < 1e-6);
    let total: f64 = out.weights.iter().flatten().sum();
    assert!((total - 8.0).abs() < 1e-9);
}

#[test]
fn ineligible_records_get_no_weight_and_do_not_count() {
    let records = correlated();
    let base = vec![1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0];
    let eligible: Vec<bool> = base.iter().map(|&w| w != 0.0).collect();
    let out = rake(&records, Some(&targets()), &base, &eligible, &RakingConfig::default()).unwrap();

    assert_eq!(out.weights[1], None);
    assert_eq!(out.weights[5], None);
    let a = records.factor("a").unwrap();
    assert!((proportion(a.codes(), &out.weights, 0) - 0.3).abs() < 1e-6);
}

#[test]
fn missing_targets_pass_base_weights_through() {
    let records = correlated();
    let base = vec![0.5, 1.0, 0.0, 2.0, 1.0, 1.0, 3.0, 1.0];
    let eligible = vec![true; 8];
    let out = rake(&records, None, &base, &eligible, &RakingConfig::default()).unwrap();
    assert_eq!(out.status, RakingStatus::NotRequested);
    assert!(!out.status.is_requested());
    let passed: Vec<f64> = out.weights.iter().map(|w| w.unwrap()).collect();
    assert_eq!(passed, base);

    let empty = TargetDistributions::new();
    let out = rake(&records, Some(&empty), &base, &eligible, &RakingConfig::default()).unwrap();
    assert_eq!(out.status, RakingStatus::NotRequested);
}

#[test]
fn level_mismatch_is_rejected_before_any_work() {
    let records = correlated();
    let base = vec![1.0; 8];
    let eligible = vec![true; 8];
    let bad = TargetDistributions::new()
        .with_target("a", [("lo", 0.5), ("mid", 0.5)]);
    let err = rake(&records, Some(&bad), &base, &eligible, &RakingConfig::default()).unwrap_err();
    match &err {
        CausalError::TargetSpecMismatch {
            covariate,
            missing_in_targets,
            missing_in_data,
        } => {
            assert_eq!(covariate, "a");
            assert_eq!(missing_in_targets, &vec!["hi".to_string()]);
            assert_eq!(missing_in_data, &vec!["mid".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(base, vec![1.0; 8]);
}

#[test]
fn bad_proportions_and_columns_are_configuration_errors() {
    let records = correlated();
    let base = vec![1.0; 8];
    let eligible = vec![true; 8];
    let cases = [
        TargetDistributions::new().with_target("a", [("lo", 0.5), ("hi", 0.6)]),
        TargetDistributions::new().with_target("a", [("lo", -0.1), ("hi", 1.1)]),
        TargetDistributions::new().with_target("nope", [("lo", 0.5), ("hi", 0.5)]),
    ];
    for targets in &cases {
        let err = rake(&records, Some(targets), &base, &eligible, &RakingConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err}");
    }
}

#[test]
fn non_convergence_follows_policy() {
    let records = correlated();
    let base = vec![1.0; 8];
    let eligible = vec![true; 8];
    let strict = RakingConfig {
        tolerance: 1e-14,
        max_iterations: 1,
        ..RakingConfig::default()
    };
    let err = rake(&records, Some(&targets()), &base, &eligible, &strict).unwrap_err();
    assert!(matches!(err, CausalError::NonConvergence { iterations: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::Convergence);

    let flagged = RakingConfig {
        on_non_convergence: ConvergencePolicy::Flag,
        ..strict
    };
    let out = rake(&records, Some(&targets()), &base, &eligible, &flagged).unwrap();
    assert!(!out.converged());
    assert!(matches!(out.status, RakingStatus::NotConverged { iterations: 1, .. }));
}

#[test]
fn positive_target_on_empty_level_fails() {
    let records = correlated();
    // Every "hi" record of `a` is ineligible.
    let base = vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
    let eligible: Vec<bool> = base.iter().map(|&w| w != 0.0).collect();
    let err = rake(&records, Some(&targets()), &base, &eligible, &RakingConfig::default())
        .unwrap_err();
    assert!(matches!(err, CausalError::EmptyLevel { ref level, .. } if level == "hi"));

    let none = vec![false; 8];
    let err = rake(&records, Some(&targets()), &base, &none, &RakingConfig::default()).unwrap_err();
    assert!(matches!(err, CausalError::NoEligibleRecords));
}

prop_compose! {
    fn proportions(k: usize)(raw in prop::collection::vec(0.05f64..1.0, k)) -> Vec<f64> {
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|v| v / total).collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn converged_raking_matches_every_level(
        copies in prop::collection::vec(1usize..4, 6),
        weights in prop::collection::vec(0.1f64..5.0, 18),
        pa in proportions(3),
        pb in proportions(2),
    ) {
        // Every (a, b) cell is populated, so the fit is attainable.
        let mut a_codes = Vec::new();
        let mut b_codes = Vec::new();
        for (cell, &count) in copies.iter().enumerate() {
            for _ in 0..count {
                a_codes.push(cell / 2);
                b_codes.push(cell % 2);
            }
        }
        let n = a_codes.len();
        let base: Vec<f64> = weights.iter().copied().cycle().take(n).collect();
        let records = RecordSet::new((0..n as i64).collect()).unwrap()
            .with_column("a", factor(&["a0", "a1", "a2"], a_codes.clone())).unwrap()
            .with_column("b", factor(&["b0", "b1"], b_codes.clone())).unwrap();
        let targets = TargetDistributions::new()
            .with_target("a", [("a0", pa[0]), ("a1", pa[1]), ("a2", pa[2])])
            .with_target("b", [("b0", pb[0]), ("b1", pb[1])]);
        let config = RakingConfig { tolerance: 1e-9, max_iterations: 10_000, ..RakingConfig::default() };

        let out = rake(&records, Some(&targets), &base, &vec![true; n], &config).unwrap();
        prop_assert!(out.converged());
        for level in 0..3 {
            prop_assert!((proportion(&a_codes, &out.weights, level) - pa[level]).abs() < 1e-8);
        }
        for level in 0..2 {
            prop_assert!((proportion(&b_codes, &out.weights, level) - pb[level]).abs() < 1e-8);
        }
        prop_assert!(out.weights.iter().flatten().all(|w| *w > 0.0));
    }
}
