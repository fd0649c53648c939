use linkcast::{
    build_windows, read_manifest, write_manifest, SequenceCheckpoint, SequenceParams,
    SequencePredictor, WindowError,
};
use tempfile::TempDir;

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("f{i}")).collect()
}

fn ramp(n: usize, width: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let features = (0..n)
        .map(|i| (0..width).map(|f| (i * 10 + f) as f64).collect())
        .collect();
    let targets = (0..n).map(|i| i as f64).collect();
    (features, targets)
}

#[test]
fn sample_indices_follow_window_horizon_stride() {
    let (features, targets) = ramp(6, 2);
    let params = SequenceParams {
        window: 3,
        horizon: 1,
        stride: 1,
    };

    let (samples, manifest, report) =
        build_windows(&features, &targets, &names(2), "y", &params).expect("windows build");

    // starts 0..=2: sample i covers rows [i, i+3), target row i+3.
    assert_eq!(samples.n_samples, 3);
    assert_eq!(report.raw_samples, 3);
    assert_eq!(samples.step(0, 0), &[0.0, 1.0]);
    assert_eq!(samples.step(0, 2), &[20.0, 21.0]);
    assert_eq!(samples.y, vec![3.0, 4.0, 5.0]);
    assert_eq!(manifest.window, 3);
    assert_eq!(manifest.horizon, 1);
}

#[test]
fn horizon_pushes_the_target_forward_and_stride_thins_samples() {
    let (features, targets) = ramp(10, 1);
    let params = SequenceParams {
        window: 2,
        horizon: 3,
        stride: 2,
    };

    let (samples, _, _) =
        build_windows(&features, &targets, &names(1), "y", &params).expect("windows build");

    // starts 0, 2, 4: target row = start + window + horizon - 1 = start + 4.
    assert_eq!(samples.n_samples, 3);
    assert_eq!(samples.y, vec![4.0, 6.0, 8.0]);
}

#[test]
fn nonfinite_targets_drop_samples_but_nonfinite_features_are_zero_filled() {
    let (mut features, mut targets) = ramp(6, 2);
    targets[3] = f64::NAN; // kills the sample targeting row 3
    features[1][0] = f64::INFINITY; // zero-filled, sample survives

    let params = SequenceParams {
        window: 3,
        horizon: 1,
        stride: 1,
    };
    let (samples, _, report) =
        build_windows(&features, &targets, &names(2), "y", &params).expect("windows build");

    assert_eq!(samples.n_samples, 2);
    assert_eq!(report.dropped_nonfinite_target, 1);
    assert!(report.zero_filled_cells >= 1);
    assert_eq!(samples.y, vec![4.0, 5.0]);
    // The poisoned cell (row 1, feature 0) is step 0 of the first surviving
    // sample and was replaced with 0.0.
    assert_eq!(samples.step(0, 0), &[0.0, 11.0]);
}

#[test]
fn zero_usable_samples_is_an_explicit_error_not_an_empty_tensor() {
    let (features, targets) = ramp(3, 1);
    let params = SequenceParams {
        window: 5,
        horizon: 1,
        stride: 1,
    };
    let err = build_windows(&features, &targets, &names(1), "y", &params)
        .expect_err("series shorter than window + horizon");
    assert!(matches!(err, WindowError::NoUsableSamples { .. }));

    let (features, mut targets) = ramp(4, 1);
    for t in targets.iter_mut() {
        *t = f64::NAN;
    }
    let params = SequenceParams {
        window: 2,
        horizon: 1,
        stride: 1,
    };
    let err = build_windows(&features, &targets, &names(1), "y", &params)
        .expect_err("every target is non-finite");
    match err {
        WindowError::NoUsableSamples {
            raw_samples,
            dropped_nonfinite_target,
        } => {
            assert_eq!(raw_samples, 2);
            assert_eq!(dropped_nonfinite_target, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn windowing_twice_yields_bit_identical_tensors_and_manifest() {
    let (features, targets) = ramp(20, 3);
    let params = SequenceParams {
        window: 4,
        horizon: 2,
        stride: 3,
    };

    let first =
        build_windows(&features, &targets, &names(3), "y", &params).expect("first build");
    let second =
        build_windows(&features, &targets, &names(3), "y", &params).expect("second build");

    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
    assert_eq!(first.1.feature_order, names(3));
}

#[test]
fn manifest_round_trips_through_disk_and_aligns_serving_windows() {
    let (features, targets) = ramp(12, 2);
    let params = SequenceParams {
        window: 4,
        horizon: 1,
        stride: 1,
    };
    let (_, manifest, _) =
        build_windows(&features, &targets, &names(2), "y", &params).expect("windows build");

    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("manifest.json");
    write_manifest(&path, &manifest).expect("write manifest");
    let loaded = read_manifest(&path).expect("read manifest");
    assert_eq!(loaded, manifest);

    // A window shaped by the manifest never shape-errors at serve time.
    let hidden = 2;
    let checkpoint = SequenceCheckpoint {
        in_features: loaded.feature_order.len(),
        hidden_size: hidden,
        window: loaded.window,
        w_ih: vec![vec![0.01; loaded.feature_order.len()]; hidden],
        w_hh: vec![vec![0.0; hidden]; hidden],
        b_h: vec![0.0; hidden],
        w_out: vec![1.0; hidden],
        b_out: 0.0,
    };
    let predictor = SequencePredictor::from_checkpoint(checkpoint).expect("checkpoint loads");

    let serving_window: Vec<Vec<f64>> = (0..loaded.window)
        .map(|t| (0..loaded.feature_order.len()).map(|f| (t + f) as f64).collect())
        .collect();
    let forecast = predictor
        .predict(&serving_window)
        .expect("manifest-shaped window predicts");
    assert!(forecast.is_finite());
}
