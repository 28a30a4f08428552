use proptest::prelude::*;
use rwe_causal::{
    error::CausalError,
    pooling::{pool, pool_with, Estimate, PoolingOptions},
};

#[test]
fn single_imputation_passes_through() {
    let pooled = pool(&[Estimate::new(-0.35, 0.12)]).unwrap();
    assert_eq!(pooled.m, 1);
    assert_eq!(pooled.estimate, -0.35);
    assert!((pooled.std_error - 0.12).abs() < 1e-15);
    assert_eq!(pooled.between, 0.0);
    assert_eq!(pooled.lambda, 0.0);
    // Large-sample complete-data df.
    assert!(pooled.df > 999_990.0);
    assert!((pooled.ci_low - (-0.35 - 1.959964 * 0.12)).abs() < 1e-5);
}

#[test]
fn three_imputations_match_hand_computation() {
    let estimates = [
        Estimate::new(1.0, 1.0),
        Estimate::new(2.0, 1.0),
        Estimate::new(3.0, 1.0),
    ];
    let pooled = pool(&estimates).unwrap();

    assert!((pooled.estimate - 2.0).abs() < 1e-12);
    assert!((pooled.within - 1.0).abs() < 1e-12);
    assert!((pooled.between - 1.0).abs() < 1e-12);
    assert!((pooled.total - 7.0 / 3.0).abs() < 1e-12);
    assert!((pooled.riv - 4.0 / 3.0).abs() < 1e-12);
    assert!((pooled.lambda - 4.0 / 7.0).abs() < 1e-12);
    // (m - 1) / lambda^2 = 6.125, barely shrunk by the huge observed df.
    assert!((pooled.df - 6.125).abs() < 1e-3);
    assert!(pooled.ci_low < 2.0 && pooled.ci_high > 2.0);
    assert!((pooled.ci_high - 2.0 - (2.0 - pooled.ci_low)).abs() < 1e-12);
    assert!((pooled.std_error - (7.0f64 / 3.0).sqrt()).abs() < 1e-12);
    // two-sided t on 2 / sqrt(7/3) with ~6.125 df
    assert!((pooled.p_value - 0.2374).abs() < 1e-3, "{pooled:?}");
}

#[test]
fn small_complete_data_df_shrinks_degrees_of_freedom() {
    let estimates = [Estimate::new(0.1, 0.2), Estimate::new(0.3, 0.25)];
    let large = pool(&estimates).unwrap();
    let small = pool_with(
        &estimates,
        &PoolingOptions {
            dfcom: Some(20.0),
            ..PoolingOptions::default()
        },
    )
    .unwrap();
    assert!(small.df < large.df);
    assert!(small.ci_high - small.ci_low > large.ci_high - large.ci_low);
}

#[test]
fn identical_estimates_floor_lambda() {
    let pooled = pool(&[Estimate::new(0.5, 0.1); 4]).unwrap();
    assert_eq!(pooled.between, 0.0);
    assert!((pooled.lambda - 1e-4).abs() < 1e-18);
    assert!(pooled.df.is_finite());
}

#[test]
fn hazard_ratio_scale() {
    let pooled = pool(&[Estimate::new(0.0, 0.1), Estimate::new(0.2, 0.1)]).unwrap();
    let (ratio, low, high) = pooled.exponentiated();
    assert!((ratio - 0.1f64.exp()).abs() < 1e-12);
    assert!(low < ratio && ratio < high);
}

#[test]
fn empty_and_invalid_inputs_are_rejected() {
    assert!(matches!(pool(&[]), Err(CausalError::EmptyPool)));
    assert!(pool(&[Estimate::new(f64::NAN, 0.1)]).is_err());
    assert!(pool(&[Estimate::new(0.1, -1.0)]).is_err());
    let bad_level = PoolingOptions {
        conf_level: 1.0,
        dfcom: None,
    };
    assert!(pool_with(&[Estimate::new(0.1, 0.1)], &bad_level).is_err());
}

proptest! {
    #[test]
    fn pooling_ignores_input_order(
        raw in prop::collection::vec((-2.0f64..2.0, 0.01f64..1.0), 2..12),
        seed in any::<u64>(),
    ) {
        let estimates: Vec<Estimate> = raw.iter().map(|&(q, se)| Estimate::new(q, se)).collect();
        let mut shuffled = estimates.clone();
        // Deterministic rotation plus reversal driven by the seed.
        shuffled.rotate_left((seed % estimates.len() as u64) as usize);
        if seed % 2 == 0 {
            shuffled.reverse();
        }
        let a = pool(&estimates).unwrap();
        let b = pool(&shuffled).unwrap();
        prop_assert_eq!(a, b);
    }
}
