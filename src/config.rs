//! Runtime settings and analysis configuration for rwe-causal.

use std::{
    env,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    data::io::{CASEID_COLUMN, IMPUTATION_COLUMN},
    pipeline::{effects::EffectConfig, orchestrator::FailurePolicy, PipelineConfig},
};

/// Seed used when `RWE_SEED` is not set.
pub const DEFAULT_SEED: u64 = 20240101;

/// Application configuration resolved from `.env` and defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root folder for input data.
    pub data_dir: PathBuf,
    /// Root folder for analytic outputs.
    pub outputs_dir: PathBuf,
    /// Run seed from which per-imputation seeds are derived.
    pub seed: u64,
    /// Upper bound on worker threads; one per core when unset.
    pub threads: Option<usize>,
}

impl Settings {
    /// Load configuration from environment with reasonable defaults.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let outputs_dir = env::var("OUTPUTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./outputs"));
        let seed = match env::var("RWE_SEED") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("RWE_SEED is not an unsigned integer: {raw}"))?,
            Err(_) => DEFAULT_SEED,
        };
        let threads = env::var("RWE_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0);

        fs::create_dir_all(&data_dir).context("creating data dir")?;
        fs::create_dir_all(&outputs_dir).context("creating outputs dir")?;

        Ok(Self {
            data_dir,
            outputs_dir,
            seed,
            threads,
        })
    }

    /// Convenience helper for derived path segments.
    pub fn join_data<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.data_dir.join(path)
    }

    /// Convenience helper for derived output path segments.
    pub fn join_output<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.outputs_dir.join(path)
    }
}

fn default_id_column() -> String {
    CASEID_COLUMN.to_string()
}

fn default_imputation_column() -> String {
    IMPUTATION_COLUMN.to_string()
}

/// One analysis, as read from a JSON file.
///
/// Covariate lists live here rather than in shared constants so concurrent
/// analyses can use different sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_imputation_column")]
    pub imputation_column: String,
    /// Columns read as categorical even when stored as numbers.
    #[serde(default)]
    pub categorical: Vec<String>,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub stratify_by: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub effect: Option<EffectConfig>,
    /// Covariates for the balance table; the model predictors when empty.
    #[serde(default)]
    pub balance_covariates: Vec<String>,
}

impl AnalysisConfig {
    pub fn balance_covariates(&self) -> &[String] {
        if self.balance_covariates.is_empty() {
            &self.pipeline.model.predictors
        } else {
            &self.balance_covariates
        }
    }
}

/// Read an analysis configuration from a JSON file.
pub fn load_analysis(path: &Path) -> anyhow::Result<AnalysisConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading analysis config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing analysis config {}", path.display()))
}
