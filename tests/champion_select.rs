use std::collections::BTreeMap;

use linkcast::{
    load_descriptor, select_and_persist, select_champion, write_metrics, ModelMetrics,
    SelectionConfig, SelectionError, SelectionPolicy, SplitMetrics,
};
use tempfile::TempDir;

fn metrics_record(model_type: &str, target: &str, test_mae: f64) -> ModelMetrics {
    let mut splits = BTreeMap::new();
    splits.insert(
        "train".to_string(),
        SplitMetrics {
            mae: test_mae / 2.0,
            rmse: test_mae / 2.0,
            smape: 0.05,
        },
    );
    splits.insert(
        "test".to_string(),
        SplitMetrics {
            mae: test_mae,
            rmse: test_mae * 1.2,
            smape: 0.1,
        },
    );

    ModelMetrics {
        model_type: model_type.to_string(),
        model_path: format!("models/{model_type}_{target}.json"),
        target: target.to_string(),
        feature_names: vec!["sum_energy_wh_lag_1".to_string(), "hour".to_string()],
        splits,
        n_train: 700,
        n_test: 150,
    }
}

fn seed(dir: &TempDir, name: &str, metrics: &ModelMetrics) {
    write_metrics(&dir.path().join(name), metrics).expect("write metrics record");
}

#[test]
fn joint_policy_picks_the_lowest_test_mae_across_families_and_targets() {
    let dir = TempDir::new().expect("temp metrics dir");
    seed(&dir, "tabular_energy.json", &metrics_record("tabular", "sum_energy_wh", 4.0));
    seed(&dir, "sequence_energy.json", &metrics_record("sequence", "sum_energy_wh", 2.5));
    seed(&dir, "tabular_duration.json", &metrics_record("tabular", "sum_duration_s", 9.0));

    let cfg = SelectionConfig::default();
    let (file, metrics) = select_champion(dir.path(), &cfg).expect("selection succeeds");

    assert_eq!(file, "sequence_energy.json");
    assert_eq!(metrics.model_type, "sequence");
}

#[test]
fn selection_is_deterministic_with_filename_tie_break() {
    let dir = TempDir::new().expect("temp metrics dir");
    seed(&dir, "b_family.json", &metrics_record("tabular", "sum_energy_wh", 3.0));
    seed(&dir, "a_family.json", &metrics_record("sequence", "sum_energy_wh", 3.0));

    let cfg = SelectionConfig::default();
    for _ in 0..3 {
        let (file, _) = select_champion(dir.path(), &cfg).expect("selection succeeds");
        assert_eq!(file, "a_family.json");
    }
}

#[test]
fn per_target_policy_only_considers_the_serving_target() {
    let dir = TempDir::new().expect("temp metrics dir");
    seed(&dir, "tabular_energy.json", &metrics_record("tabular", "sum_energy_wh", 4.0));
    seed(&dir, "sequence_duration.json", &metrics_record("sequence", "sum_duration_s", 0.5));

    let cfg = SelectionConfig {
        policy: SelectionPolicy::PerTarget,
        serving_target: "sum_energy_wh".to_string(),
    };
    let (file, metrics) = select_champion(dir.path(), &cfg).expect("selection succeeds");

    // The globally better duration record is not eligible for this target.
    assert_eq!(file, "tabular_energy.json");
    assert_eq!(metrics.target, "sum_energy_wh");
}

#[test]
fn no_metrics_is_an_explicit_selection_error() {
    let dir = TempDir::new().expect("temp metrics dir");
    let err = select_champion(dir.path(), &SelectionConfig::default())
        .expect_err("empty metrics dir");
    assert!(matches!(err, SelectionError::NoMetrics { .. }));
}

#[test]
fn records_without_a_test_split_are_skipped() {
    let dir = TempDir::new().expect("temp metrics dir");
    let mut train_only = metrics_record("tabular", "sum_energy_wh", 1.0);
    train_only.splits.remove("test");
    seed(&dir, "train_only.json", &train_only);
    seed(&dir, "complete.json", &metrics_record("sequence", "sum_energy_wh", 5.0));

    let (file, _) =
        select_champion(dir.path(), &SelectionConfig::default()).expect("selection succeeds");
    assert_eq!(file, "complete.json");
}

#[test]
fn persisted_descriptor_carries_a_monotonic_version() {
    let metrics_dir = TempDir::new().expect("temp metrics dir");
    seed(
        &metrics_dir,
        "tabular_energy.json",
        &metrics_record("tabular", "sum_energy_wh", 4.0),
    );
    let out_dir = TempDir::new().expect("temp models dir");
    let champion_path = out_dir.path().join("champion.json");

    let cfg = SelectionConfig::default();
    let first =
        select_and_persist(metrics_dir.path(), &champion_path, &cfg, 1_000).expect("first run");
    assert_eq!(first.version, 1);
    assert_eq!(first.selected_at_ts_ms, 1_000);
    assert_eq!(first.model_type, "tabular");
    assert_eq!(first.test_mae, 4.0);

    // A better family lands; re-selection overwrites and bumps the version.
    seed(
        &metrics_dir,
        "sequence_energy.json",
        &metrics_record("sequence", "sum_energy_wh", 2.0),
    );
    let second =
        select_and_persist(metrics_dir.path(), &champion_path, &cfg, 2_000).expect("second run");
    assert_eq!(second.version, 2);
    assert_eq!(second.model_type, "sequence");

    let loaded = load_descriptor(&champion_path).expect("descriptor loads");
    assert_eq!(loaded, second);
}
