use predicates::prelude::*;

use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// A model with one malicious and one benign feature and the given test split.
fn write_model(path: &Path, test: serde_json::Value) {
    let model = serde_json::json!({
        "schema_version": 1,
        "feature_names": ["urls::http://evil_com", "urls::http://good_com"],
        "coefficients": [1.0, -1.0],
        "intercept": 0.0,
        "train": [],
        "test": test,
    });
    fs::write(path, serde_json::to_vec(&model).unwrap()).unwrap();
}

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let root = dir.path();
    let config = format!(
        "model: {}\ntmp_dir: {}\nice_box: {}\nresults_dir: {}\ngoodware_location: {}\n",
        root.join("model.json").display(),
        root.join("tmp").display(),
        root.join("ice-box").display(),
        root.join("results").display(),
        root.join("apps").display(),
    );
    let path = root.join("config.yml");
    fs::write(&path, config).unwrap();
    path
}

/// Test that the binary runs and shows help
#[test]

fn test_help_command() {
    assert_cmd::cargo_bin_cmd!("apg")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("organ transplantation"));
}

/// Test that the binary shows version
#[test]

fn test_version_command() {
    assert_cmd::cargo_bin_cmd!("apg")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("apg"));
}

/// Test that every subcommand is listed
#[test]

fn test_help_lists_subcommands() {
    let assert = assert_cmd::cargo_bin_cmd!("apg").arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for sub in ["harvest", "attack", "transplant", "run"] {
        assert!(stdout.contains(sub), "help is missing {sub}");
    }
}

/// Test a missing configuration file
#[test]

fn test_missing_config() {
    assert_cmd::cargo_bin_cmd!("apg")
        .args(["--config", "/nonexistent/config.yml", "harvest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

/// Test that unknown configuration keys are rejected
#[test]

fn test_unknown_config_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(&path, "tries: 2\nbogus_key: true\n").unwrap();

    assert_cmd::cargo_bin_cmd!("apg")
        .args(["--config", path.to_str().unwrap(), "harvest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

/// Test that a zero retry budget is rejected
#[test]

fn test_zero_tries_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(&path, "tries: 0\n").unwrap();

    assert_cmd::cargo_bin_cmd!("apg")
        .args(["--config", path.to_str().unwrap(), "attack"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tries must be greater than 0"));
}

/// Test harvesting with no donors in the training split
#[test]

fn test_harvest_without_donors() {
    let dir = TempDir::new().unwrap();
    write_model(&dir.path().join("model.json"), serde_json::json!([]));
    let config = write_config(&dir);

    assert_cmd::cargo_bin_cmd!("apg")
        .args(["--config", config.to_str().unwrap(), "harvest"])
        .env("NO_COLOR", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains("Organs harvested: 0"));
}

/// Test a full run with no true positives writes the run metadata
#[test]

fn test_run_without_true_positives() {
    let dir = TempDir::new().unwrap();
    let benign = serde_json::json!([{
        "sample_path": dir.path().join("apps/GOOD.apk"),
        "sha256": "GOOD",
        "label": 0,
        "features": {"urls::http://good_com": 1.0},
    }]);
    write_model(&dir.path().join("model.json"), benign);
    let config = write_config(&dir);

    assert_cmd::cargo_bin_cmd!("apg")
        .args([
            "--config",
            config.to_str().unwrap(),
            "run",
            "--run-tag",
            "empty",
            "--confidence",
            "low",
            "--serial",
            "--skip-harvest",
        ])
        .env("NO_COLOR", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains("APG run summary"))
        .stdout(predicate::str::contains("0 succeeded"));

    let run_dir = dir.path().join("results/empty");
    let run: serde_json::Value = serde_json::from_slice(&fs::read(run_dir.join("run.json")).unwrap()).unwrap();
    assert_eq!(run["number_of_apps"]["tps"], 0);
    assert_eq!(run["confidence"]["margin"], 0.0);

    let tps: Vec<String> = serde_json::from_slice(&fs::read(run_dir.join("tp_shas.json")).unwrap()).unwrap();
    assert!(tps.is_empty());
    let y: Vec<u8> = serde_json::from_slice(&fs::read(run_dir.join("y.adv.json")).unwrap()).unwrap();
    assert!(y.is_empty());
}

/// Test that an unparseable confidence level fails the run
#[test]

fn test_run_rejects_unknown_confidence() {
    let dir = TempDir::new().unwrap();
    write_model(&dir.path().join("model.json"), serde_json::json!([]));
    let config = write_config(&dir);

    assert_cmd::cargo_bin_cmd!("apg")
        .args([
            "--config",
            config.to_str().unwrap(),
            "attack",
            "--confidence",
            "extreme",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown confidence level"));
}
