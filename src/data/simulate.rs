//! Seeded synthetic oncology cohort with pseudo-imputed covariates.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal, Poisson};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    data::{
        imputed::ImputedDatasets,
        records::{Column, Factor, RecordSet},
    },
    error::{CausalError, Result},
};

/// Administrative end of follow-up, in months.
const FOLLOW_UP: f64 = 36.0;
const BASELINE_HAZARD: f64 = 0.045;
const TRUE_HAZARD_RATIO: f64 = 0.7;

const RACE_LEVELS: [(&str, f64); 3] = [("Asian", 0.62), ("White", 0.36), ("Other", 0.02)];
const SMOKING_LEVELS: [&str; 2] = ["Current/former", "Never"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub n: usize,
    pub imputations: usize,
    pub seed: u64,
    /// Probability that a partially observed covariate is missing.
    pub missing_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n: 3500,
            imputations: 10,
            seed: 20240101,
            missing_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
struct Patient {
    age: f64,
    female: bool,
    race: usize,
    smoker: bool,
    ecog: bool,
    met_sites: f64,
    hemoglobin: f64,
    treat: bool,
    time: f64,
    event: bool,
    missing_smoking: bool,
    missing_ecog: bool,
    missing_hemoglobin: bool,
}

fn dist_error(err: impl std::fmt::Display) -> CausalError {
    CausalError::InvalidConfig(format!("simulation distribution: {err}"))
}

fn draw_race(rng: &mut StdRng) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (idx, (_, p)) in RACE_LEVELS.iter().enumerate() {
        acc += p;
        if u < acc {
            return idx;
        }
    }
    RACE_LEVELS.len() - 1
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Per-imputation draws for the partially observed covariates.
struct Imputer {
    hemoglobin: Normal<f64>,
}

impl Imputer {
    fn new() -> Result<Self> {
        Ok(Self {
            hemoglobin: Normal::<f64>::new(12.8, 1.6).map_err(dist_error)?,
        })
    }

    /// Conditional draws given the always-observed covariates.
    fn fill(&self, patient: &Patient, rng: &mut StdRng) -> (bool, bool, f64) {
        let smoker = if patient.missing_smoking {
            rng.gen_bool(logistic(-0.8 + if patient.female { -0.9 } else { 0.4 }))
        } else {
            patient.smoker
        };
        let ecog = if patient.missing_ecog {
            rng.gen_bool(logistic(0.3 + 0.03 * (patient.age - 64.0)))
        } else {
            patient.ecog
        };
        let hemoglobin = if patient.missing_hemoglobin {
            self.hemoglobin.sample(rng) - if patient.female { 0.6 } else { 0.0 }
        } else {
            patient.hemoglobin
        };
        (smoker, ecog, hemoglobin)
    }
}

fn draw_cohort(config: &SimulationConfig, rng: &mut StdRng) -> Result<Vec<Patient>> {
    let age = Normal::<f64>::new(64.0, 10.0).map_err(dist_error)?;
    let hemoglobin = Normal::<f64>::new(12.8, 1.6).map_err(dist_error)?;
    let sites = Poisson::<f64>::new(1.2).map_err(dist_error)?;
    let censoring = Exp::<f64>::new(1.0 / 60.0).map_err(dist_error)?;

    let mut cohort = Vec::with_capacity(config.n);
    for _ in 0..config.n {
        let age_value = age.sample(rng).clamp(30.0, 90.0);
        let female = rng.gen_bool(0.64);
        let race = draw_race(rng);
        let smoker = rng.gen_bool(logistic(-0.8 + if female { -0.9 } else { 0.4 }));
        let ecog = rng.gen_bool(logistic(0.3 + 0.03 * (age_value - 64.0)));
        let extra_sites: f64 = sites.sample(rng);
        let met_sites = (1.0 + extra_sites).min(6.0);
        let hgb = hemoglobin.sample(rng) - if female { 0.6 } else { 0.0 };

        let asian = if race == 0 { 1.0 } else { 0.0 };
        let linear = 0.4 - 0.02 * (age_value - 64.0) + 0.25 * f64::from(u8::from(female))
            + 0.5 * asian
            - 0.35 * f64::from(u8::from(smoker))
            - 0.3 * f64::from(u8::from(ecog))
            - 0.1 * (met_sites - 2.0);
        let treat = rng.gen_bool(logistic(linear));

        let risk = TRUE_HAZARD_RATIO.ln() * f64::from(u8::from(treat))
            + 0.015 * (age_value - 64.0)
            + 0.35 * f64::from(u8::from(ecog))
            + 0.15 * (met_sites - 2.0)
            - 0.12 * (hgb - 12.8)
            + 0.2 * f64::from(u8::from(smoker));
        let rate = BASELINE_HAZARD * risk.exp();
        let event_time = Exp::<f64>::new(rate).map_err(dist_error)?.sample(rng);
        let censor_time = censoring.sample(rng).min(FOLLOW_UP);

        cohort.push(Patient {
            age: age_value,
            female,
            race,
            smoker,
            ecog,
            met_sites,
            hemoglobin: hgb,
            treat,
            time: event_time.min(censor_time),
            event: event_time <= censor_time,
            missing_smoking: rng.gen_bool(config.missing_rate / 2.0),
            missing_ecog: rng.gen_bool(config.missing_rate),
            missing_hemoglobin: rng.gen_bool(config.missing_rate),
        });
    }
    Ok(cohort)
}

fn indicator(values: impl Iterator<Item = bool>) -> Column {
    Column::Numeric(values.map(|v| if v { 1.0 } else { 0.0 }).collect())
}

fn materialize(cohort: &[Patient], filled: &[(bool, bool, f64)]) -> Result<RecordSet> {
    let caseid = (1..=cohort.len() as i64).collect();
    let race_levels: Vec<String> = RACE_LEVELS.iter().map(|(l, _)| l.to_string()).collect();
    let smoking_levels: Vec<String> = SMOKING_LEVELS.iter().map(|l| l.to_string()).collect();
    let ecog_levels = vec!["0".to_string(), "1".to_string()];

    RecordSet::new(caseid)?
        .with_column(
            "dem_age_index_cont",
            Column::Numeric(cohort.iter().map(|p| p.age).collect()),
        )?
        .with_column("dem_sex_cont", indicator(cohort.iter().map(|p| p.female)))?
        .with_column(
            "dem_race",
            Column::Categorical(Factor::new(
                race_levels,
                cohort.iter().map(|p| p.race).collect(),
            )?),
        )?
        .with_column(
            "c_smoking_history",
            Column::Categorical(Factor::new(
                smoking_levels,
                filled.iter().map(|f| if f.0 { 0 } else { 1 }).collect(),
            )?),
        )?
        .with_column(
            "c_ecog_cont",
            Column::Categorical(Factor::new(
                ecog_levels,
                filled.iter().map(|f| usize::from(f.1)).collect(),
            )?),
        )?
        .with_column(
            "c_number_met_sites",
            Column::Numeric(cohort.iter().map(|p| p.met_sites).collect()),
        )?
        .with_column(
            "c_hemoglobin_g_dl_cont",
            Column::Numeric(filled.iter().map(|f| f.2).collect()),
        )?
        .with_column("treat", indicator(cohort.iter().map(|p| p.treat)))?
        .with_column(
            "time",
            Column::Numeric(cohort.iter().map(|p| p.time).collect()),
        )?
        .with_column("event", indicator(cohort.iter().map(|p| p.event)))
}

/// Simulate one cohort and M completed copies of it.
///
/// Treatment and outcome depend on the true covariates; every imputation
/// redraws the values flagged missing from its own seeded stream.
pub fn simulate_cohort(config: &SimulationConfig) -> Result<ImputedDatasets> {
    if config.n == 0 || config.imputations == 0 {
        return Err(CausalError::InvalidConfig(
            "simulation needs at least one record and one imputation".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.missing_rate) {
        return Err(CausalError::InvalidConfig(format!(
            "missing rate must lie in [0, 1], got {}",
            config.missing_rate
        )));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let cohort = draw_cohort(config, &mut rng)?;
    let imputer = Imputer::new()?;

    let mut datasets = Vec::with_capacity(config.imputations);
    for m in 1..=config.imputations {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(m as u64 * 7919));
        let filled: Vec<_> = cohort.iter().map(|p| imputer.fill(p, &mut rng)).collect();
        datasets.push(materialize(&cohort, &filled)?);
        debug!(imputation = m, "materialized imputation");
    }

    let treated = cohort.iter().filter(|p| p.treat).count();
    let events = cohort.iter().filter(|p| p.event).count();
    info!(
        n = config.n,
        imputations = config.imputations,
        treated,
        events,
        "simulated cohort"
    );
    ImputedDatasets::new(datasets)
}
