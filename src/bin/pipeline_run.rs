use linkcast::{
    aggregate_events, assign_splits, build_features, build_split_windows, init_logging,
    load_params, load_raw_events, logging_config_from_env, open_store, params_path_from_env,
    read_windows_sorted, write_features_csv, write_manifest, write_windows, Split,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let (params_path, required) = params_path_from_env();
    let config = load_params(&params_path, required)?;

    println!(
        "Pipeline run start | params={} raw_dir={} store={}",
        params_path.display(),
        config.data.raw_dir.display(),
        config.data.store_path.display()
    );

    let (events, ingest_report) = load_raw_events(&config.data.raw_dir)?;
    println!(
        "Ingest | files={} events={} malformed_dropped={} duplicates_dropped={}",
        ingest_report.files_read,
        ingest_report.events_parsed,
        ingest_report.malformed_dropped,
        ingest_report.duplicates_dropped
    );

    let (window_rows, aggregate_report) = aggregate_events(&events, &config.aggregate)?;
    if let Some(parent) = config.data.store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut store = open_store(&config.data.store_path)?;
    write_windows(&mut store, &window_rows)?;
    println!(
        "Aggregate | windows={} dropped_self_links={} dropped_nonpositive_duration={}",
        aggregate_report.output_windows,
        aggregate_report.dropped_self_links,
        aggregate_report.dropped_nonpositive_duration
    );

    let stored = read_windows_sorted(&store)?;
    let (mut table, feature_report) =
        build_features(&stored, &config.features, &config.aliases)?;
    let split_summary = assign_splits(&mut table, &config.split)?;
    write_features_csv(&config.data.features_path, &table)?;
    println!(
        "Features | rows={} groups={} columns={} kpi={:?}",
        feature_report.input_rows,
        feature_report.groups,
        feature_report.columns,
        feature_report.kpi_status
    );
    println!(
        "Splits | train={} val={} test={}",
        split_summary.train_rows, split_summary.val_rows, split_summary.test_rows
    );

    // Sequence tensors per split for the serving target; trainers consume
    // these in-process, the manifest is the on-disk contract.
    let target = &config.selection.serving_target;
    std::fs::create_dir_all(&config.data.windows_dir)?;
    let mut manifest_written = false;
    for split in [Split::Train, Split::Val, Split::Test] {
        match build_split_windows(&table, target, split, &config.seq) {
            Ok((samples, manifest, report)) => {
                if !manifest_written {
                    write_manifest(&config.data.windows_dir.join("manifest.json"), &manifest)?;
                    manifest_written = true;
                }
                println!(
                    "Windows[{}] | samples={} dropped_nonfinite_target={} zero_filled_cells={} features={}",
                    split.as_str(),
                    samples.n_samples,
                    report.dropped_nonfinite_target,
                    report.zero_filled_cells,
                    samples.n_features
                );
            }
            Err(err) if split != Split::Train => {
                // Short val/test slices can legitimately produce no samples.
                println!("Windows[{}] | skipped: {err}", split.as_str());
            }
            Err(err) => return Err(err.into()),
        }
    }

    println!("Pipeline run complete.");
    Ok(())
}
