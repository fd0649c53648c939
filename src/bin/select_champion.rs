use chrono::Utc;
use linkcast::{
    init_logging, load_params, logging_config_from_env, params_path_from_env, select_and_persist,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let (params_path, required) = params_path_from_env();
    let config = load_params(&params_path, required)?;

    let descriptor = select_and_persist(
        &config.data.metrics_dir,
        &config.data.champion_path,
        &config.selection,
        Utc::now().timestamp_millis(),
    )?;

    println!(
        "Champion | model_type={} model_path={} target={} test_mae={} source={} version={}",
        descriptor.model_type,
        descriptor.model_path,
        descriptor.target,
        descriptor.test_mae,
        descriptor.source_metrics_file,
        descriptor.version
    );
    Ok(())
}
