use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn rwe(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("rwe-causal").expect("binary exists");
    cmd.env("DATA_DIR", dir.join("data"))
        .env("OUTPUTS_DIR", dir.join("outputs"))
        .env("RWE_SEED", "11");
    cmd
}

#[test]
fn cli_help_runs() {
    let mut cmd = Command::cargo_bin("rwe-causal").expect("binary exists");
    cmd.arg("--help").assert().success();
}

#[test]
fn pool_prints_pooled_estimate() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("estimates.csv");
    fs::write(&input, "estimate,std_error\n-0.30,0.10\n-0.36,0.11\n-0.33,0.09\n").unwrap();

    let out = rwe(dir.path())
        .args(["pool", "--input"])
        .arg(&input)
        .arg("--exponentiate")
        .output()
        .unwrap();
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["m"], 3);
    assert!((json["estimate"].as_f64().unwrap() + 0.33).abs() < 1e-12);
    assert!(json["exp_estimate"].as_f64().unwrap() < 1.0);
}

#[test]
fn simulate_then_analyze_writes_outputs() {
    let dir = tempdir().unwrap();
    let cohort = dir.path().join("cohort.csv");
    rwe(dir.path())
        .args(["simulate", "--n", "600", "--imputations", "3", "--out"])
        .arg(&cohort)
        .assert()
        .success();
    assert!(cohort.exists());

    let config = dir.path().join("analysis.json");
    fs::write(
        &config,
        r#"{
            "model": {
                "treatment": "treat",
                "predictors": ["dem_age_index_cont", "dem_sex_cont", "c_ecog_cont", "c_number_met_sites"]
            },
            "mode": "matching",
            "caliper": 0.2,
            "categorical": ["c_ecog_cont"],
            "targets": {
                "dem_sex_cont": {"0": 0.45, "1": 0.55}
            },
            "effect": {"cluster": "subclass"}
        }"#,
    )
    .unwrap();

    rwe(dir.path())
        .args(["analyze", "--input"])
        .arg(&cohort)
        .arg("--config")
        .arg(&config)
        .assert()
        .success();

    let outputs = dir.path().join("outputs");
    for name in ["run_report.json", "weights_long.parquet", "balance.csv", "effects.csv"] {
        assert!(outputs.join(name).exists(), "{name} missing");
    }
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(outputs.join("run_report.json")).unwrap()).unwrap();
    assert_eq!(report["total"], 3);
    assert_eq!(report["succeeded"], 3);
    assert_eq!(report["seed"], 11);
}
