use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn test_synth_train_detect() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("blobs.json");
    let config = dir.path().join("config.json");
    let model = dir.path().join("detector.json");
    let report = dir.path().join("report.json");
    let results = dir.path().join("results.json");

    Command::cargo_bin("recondet")
        .unwrap()
        .args(["synth", "--kind", "blobs", "--normal", "200", "--anomalous", "10", "--width", "6"])
        .arg("--output")
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 210 rows"));

    std::fs::write(
        &config,
        r#"{"model": {"hidden_dims": [4], "latent_dim": 2}, "training": {"epochs": 3}}"#,
    )
    .unwrap();

    Command::cargo_bin("recondet")
        .unwrap()
        .arg("train")
        .arg("--dataset")
        .arg(&data)
        .arg("--config")
        .arg(&config)
        .arg("--output")
        .arg(&model)
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("=== Evaluation Metrics ==="))
        .stdout(predicate::str::contains("Model saved to"));
    assert!(model.exists());
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert!(saved["auc_roc"].is_number());

    Command::cargo_bin("recondet")
        .unwrap()
        .arg("detect")
        .arg("--dataset")
        .arg(&data)
        .arg("--model")
        .arg(&model)
        .arg("--output")
        .arg(&results)
        .assert()
        .success();
    let detections: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&results).unwrap()).unwrap();
    assert_eq!(detections.len(), 210);
    assert!(detections.iter().all(|d| d["score"].as_f64().unwrap() >= 0.0));
}

#[test]
fn test_bad_config_names_stage() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("blobs.json");
    let config = dir.path().join("config.json");

    Command::cargo_bin("recondet")
        .unwrap()
        .args(["synth", "--normal", "20", "--anomalous", "2", "--width", "4"])
        .arg("--output")
        .arg(&data)
        .assert()
        .success();
    std::fs::write(&config, r#"{"training": {"epochs": 0}}"#).unwrap();

    Command::cargo_bin("recondet")
        .unwrap()
        .arg("train")
        .arg("--dataset")
        .arg(&data)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("configure stage failed"));
}

#[test]
fn test_train_narrow_table_without_config() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("narrow.json");

    Command::cargo_bin("recondet")
        .unwrap()
        .args(["synth", "--normal", "150", "--anomalous", "10", "--width", "8"])
        .arg("--output")
        .arg(&data)
        .assert()
        .success();

    Command::cargo_bin("recondet")
        .unwrap()
        .arg("train")
        .arg("--dataset")
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("=== Evaluation Metrics ==="));
}

#[test]
fn test_missing_dataset() {
    Command::cargo_bin("recondet")
        .unwrap()
        .args(["detect", "--dataset", "does-not-exist.json", "--model", "nope.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load model"));
}
