use rand::{rngs::StdRng, Rng, SeedableRng};
use rwe_causal::{
    error::ErrorKind,
    outcome::{CoxConfig, CoxModel, SurvivalData, Ties},
};

/// Exponential event times with a binary covariate and random censoring.
fn simulated(n: usize, log_hr: f64, seed: u64) -> (Vec<f64>, Vec<bool>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut time = Vec::with_capacity(n);
    let mut event = Vec::with_capacity(n);
    let mut x = Vec::with_capacity(n);
    for _ in 0..n {
        let xi = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
        let rate = 0.1 * (log_hr * xi).exp();
        let t = -(1.0 - rng.gen::<f64>()).ln() / rate;
        let c = (-(1.0 - rng.gen::<f64>()).ln() / 0.04).min(24.0);
        time.push(t.min(c));
        event.push(t <= c);
        x.push(xi);
    }
    (time, event, x)
}

#[test]
fn recovers_simulated_hazard_ratio() {
    let (time, event, x) = simulated(3000, 0.5f64.ln(), 17);
    let data = SurvivalData::new(time, event, vec![1.0; 3000])
        .unwrap()
        .with_covariate("treatment", x)
        .unwrap()
        .with_clusters((0..3000).collect())
        .unwrap();
    let fit = CoxModel::default().fit(&data).unwrap();
    let coef = fit.coefficient("treatment").unwrap();

    assert!((coef.estimate - 0.5f64.ln()).abs() < 0.15, "{coef:?}");
    assert!(coef.hazard_ratio < 0.65 && coef.hazard_ratio > 0.38);
    let robust = coef.robust_se.unwrap();
    assert!(robust > 0.0);
    assert!((robust / coef.naive_se - 1.0).abs() < 0.2);
    assert_eq!(coef.std_error, robust);
    assert!(coef.p_value < 1e-6);
    assert!(fit.loglik > fit.loglik_null);
    assert_eq!(fit.clusters, Some(3000));
}

#[test]
fn zero_weight_rows_do_not_enter_the_fit() {
    let (time, event, x) = simulated(400, -0.3, 5);
    let mut weights = vec![1.0; 400];
    for w in weights.iter_mut().step_by(3) {
        *w = 0.0;
    }
    let full = SurvivalData::new(time.clone(), event.clone(), weights.clone())
        .unwrap()
        .with_covariate("treatment", x.clone())
        .unwrap();
    let keep: Vec<usize> = (0..400).filter(|i| weights[*i] > 0.0).collect();
    let pick = |v: &[f64]| keep.iter().map(|&i| v[i]).collect::<Vec<_>>();
    let kept = SurvivalData::new(
        pick(&time),
        keep.iter().map(|&i| event[i]).collect(),
        vec![1.0; keep.len()],
    )
    .unwrap()
    .with_covariate("treatment", pick(&x))
    .unwrap();

    let model = CoxModel::default();
    let a = model.fit(&full).unwrap();
    let b = model.fit(&kept).unwrap();
    assert_eq!(a.n, keep.len());
    assert_eq!(a.coefficients[0].estimate, b.coefficients[0].estimate);
    assert_eq!(a.coefficients[0].naive_se, b.coefficients[0].naive_se);
}

#[test]
fn integer_weights_equal_duplicated_rows_under_breslow() {
    let time = vec![1.0, 2.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
    let event = vec![true, true, false, true, true, false, true, true];
    let x = vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0];
    let weights = vec![2.0, 1.0, 1.0, 1.0, 2.0, 1.0, 1.0, 1.0];

    let mut dup_time = Vec::new();
    let mut dup_event = Vec::new();
    let mut dup_x = Vec::new();
    for i in 0..time.len() {
        for _ in 0..weights[i] as usize {
            dup_time.push(time[i]);
            dup_event.push(event[i]);
            dup_x.push(x[i]);
        }
    }

    let model = CoxModel::new(CoxConfig {
        ties: Ties::Breslow,
        ..CoxConfig::default()
    });
    let weighted = SurvivalData::new(time, event, weights)
        .unwrap()
        .with_covariate("x", x)
        .unwrap();
    let n = dup_time.len();
    let duplicated = SurvivalData::new(dup_time, dup_event, vec![1.0; n])
        .unwrap()
        .with_covariate("x", dup_x)
        .unwrap();
    let a = model.fit(&weighted).unwrap();
    let b = model.fit(&duplicated).unwrap();
    assert!((a.coefficients[0].estimate - b.coefficients[0].estimate).abs() < 1e-8);
    assert!((a.coefficients[0].naive_se - b.coefficients[0].naive_se).abs() < 1e-8);
    assert!((a.loglik - b.loglik).abs() < 1e-8);
}

#[test]
fn ties_methods_agree_without_ties() {
    let (time, event, x) = simulated(300, 0.4, 9);
    let data = SurvivalData::new(time, event, vec![1.0; 300])
        .unwrap()
        .with_covariate("x", x)
        .unwrap();
    let efron = CoxModel::default().fit(&data).unwrap();
    let breslow = CoxModel::new(CoxConfig {
        ties: Ties::Breslow,
        ..CoxConfig::default()
    })
    .fit(&data)
    .unwrap();
    assert!((efron.coefficients[0].estimate - breslow.coefficients[0].estimate).abs() < 1e-10);
}

#[test]
fn degenerate_inputs_fail_as_model_errors() {
    let no_events = SurvivalData::new(vec![1.0, 2.0], vec![false, false], vec![1.0, 1.0])
        .unwrap()
        .with_covariate("x", vec![0.0, 1.0])
        .unwrap();
    let err = CoxModel::default().fit(&no_events).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Model);

    assert!(SurvivalData::new(vec![-1.0], vec![true], vec![1.0]).is_err());
    assert!(SurvivalData::new(vec![1.0], vec![true], vec![1.0, 2.0]).is_err());
}

#[test]
fn adjusts_for_a_second_covariate() {
    let (time, event, x) = simulated(2000, 0.5f64.ln(), 23);
    let mut rng = StdRng::seed_from_u64(29);
    let noise: Vec<f64> = (0..2000).map(|_| rng.gen::<f64>() - 0.5).collect();
    let data = SurvivalData::new(time, event, vec![1.0; 2000])
        .unwrap()
        .with_covariate("treatment", x)
        .unwrap()
        .with_covariate("noise", noise)
        .unwrap()
        .with_clusters((0..2000).collect())
        .unwrap();
    let fit = CoxModel::default().fit(&data).unwrap();

    let treatment = fit.coefficient("treatment").unwrap();
    assert!((treatment.estimate - 0.5f64.ln()).abs() < 0.2, "{treatment:?}");
    let noise = fit.coefficient("noise").unwrap();
    assert!(noise.estimate.abs() < 4.0 * noise.naive_se, "{noise:?}");
    for coef in &fit.coefficients {
        let robust = coef.robust_se.unwrap();
        assert!((robust / coef.naive_se - 1.0).abs() < 0.25, "{coef:?}");
    }
}

#[test]
fn constant_covariate_makes_information_singular() {
    let (time, event, x) = simulated(200, 0.2, 3);
    let data = SurvivalData::new(time, event, vec![1.0; 200])
        .unwrap()
        .with_covariate("x", x)
        .unwrap()
        .with_covariate("site", vec![1.0; 200])
        .unwrap();
    let err = CoxModel::default().fit(&data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Model);
    assert!(err.to_string().contains("singular"), "{err}");
}
