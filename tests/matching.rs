use rwe_causal::{
    error::CausalError,
    propensity::{
        matching::{nearest_neighbor, MatchOrder, MatchingConfig},
        DataWarning, Estimand,
    },
};

fn config() -> MatchingConfig {
    MatchingConfig {
        std_caliper: false,
        ..MatchingConfig::default()
    }
}

#[test]
fn one_to_one_without_replacement() {
    // rows: T 0.9, T 0.5, C 0.88, C 0.52, C 0.1
    let distance = [0.9, 0.5, 0.88, 0.52, 0.1];
    let treated = [true, true, false, false, false];
    let out = nearest_neighbor(&distance, &treated, &config(), 7).unwrap();

    assert_eq!(out.weights, vec![1.0, 1.0, 1.0, 1.0, 0.0]);
    assert_eq!(out.pairs, vec![(0, vec![2]), (1, vec![3])]);
    assert_eq!(out.subclass, vec![Some(1), Some(2), Some(1), Some(2), None]);
    assert!(out.warnings.is_empty());
}

#[test]
fn caliper_leaves_distant_focal_units_unmatched() {
    let distance = [0.9, 0.3, 0.88, 0.1];
    let treated = [true, true, false, false];
    let cfg = MatchingConfig {
        caliper: Some(0.05),
        ..config()
    };
    let out = nearest_neighbor(&distance, &treated, &cfg, 7).unwrap();

    assert_eq!(out.weights, vec![1.0, 0.0, 1.0, 0.0]);
    assert_eq!(out.subclass[1], None);
    assert!(out
        .warnings
        .contains(&DataWarning::UnmatchedFocal { count: 1, focal: 2 }));
}

#[test]
fn no_pair_within_caliper_is_an_error() {
    let distance = [0.9, 0.1];
    let treated = [true, false];
    let cfg = MatchingConfig {
        caliper: Some(0.01),
        ..config()
    };
    let err = nearest_neighbor(&distance, &treated, &cfg, 7).unwrap_err();
    assert!(matches!(err, CausalError::NoMatches { focal: 1, candidates: 1 }));
}

#[test]
fn replacement_weights_sum_to_matched_controls() {
    // Two treated units share control 2; treated 3 uses control 4.
    let distance = [0.50, 0.51, 0.505, 0.9, 0.91];
    let treated = [true, true, false, true, false];
    let cfg = MatchingConfig {
        replace: true,
        ..config()
    };
    let out = nearest_neighbor(&distance, &treated, &cfg, 7).unwrap();

    assert!((out.weights[2] - 4.0 / 3.0).abs() < 1e-12);
    assert!((out.weights[4] - 2.0 / 3.0).abs() < 1e-12);
    assert!((out.weights[2] + out.weights[4] - 2.0).abs() < 1e-12);
    assert!(out.subclass.iter().all(Option::is_none));
}

#[test]
fn ratio_two_splits_focal_weight() {
    let distance = [0.5, 0.45, 0.56, 0.1];
    let treated = [true, false, false, false];
    let cfg = MatchingConfig {
        ratio: 2,
        ..config()
    };
    let out = nearest_neighbor(&distance, &treated, &cfg, 7).unwrap();
    assert_eq!(out.pairs, vec![(0, vec![1, 2])]);
    assert_eq!(out.weights, vec![1.0, 1.0, 1.0, 0.0]);
}

#[test]
fn too_few_controls_is_flagged() {
    let distance = [0.5, 0.6, 0.55];
    let treated = [true, true, false];
    let out = nearest_neighbor(&distance, &treated, &config(), 7).unwrap();
    assert!(out.warnings.contains(&DataWarning::InsufficientControls {
        focal: 2,
        candidates: 1,
        ratio: 1
    }));
    // Largest-first: the 0.6 unit claims the only control.
    assert_eq!(out.weights, vec![0.0, 1.0, 1.0]);
}

#[test]
fn atc_matches_controls_to_treated() {
    let distance = [0.2, 0.8, 0.25, 0.75];
    let treated = [false, false, true, true];
    let cfg = MatchingConfig {
        estimand: Estimand::Atc,
        ..config()
    };
    let out = nearest_neighbor(&distance, &treated, &cfg, 7).unwrap();
    assert_eq!(out.pairs, vec![(0, vec![2]), (1, vec![3])]);
}

#[test]
fn ate_matching_is_rejected() {
    let cfg = MatchingConfig {
        estimand: Estimand::Ate,
        ..config()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn random_order_is_reproducible_per_seed() {
    let distance: Vec<f64> = (0..40).map(|i| (i as f64 * 0.37).fract()).collect();
    let treated: Vec<bool> = (0..40).map(|i| i % 3 == 0).collect();
    let cfg = MatchingConfig {
        order: MatchOrder::Random,
        ..config()
    };
    let a = nearest_neighbor(&distance, &treated, &cfg, 11).unwrap();
    let b = nearest_neighbor(&distance, &treated, &cfg, 11).unwrap();
    assert_eq!(a.pairs, b.pairs);
    assert_eq!(a.weights, b.weights);
}
