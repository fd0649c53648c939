use std::{net::SocketAddr, sync::Arc};

use linkcast::{
    init_logging, load_champion, load_params, log_app_bind, log_app_start, log_champion_loaded,
    logging_config_from_env, params_path_from_env, predict_router, ServeState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("forecast_server", &logging_cfg);

    let (params_path, required) = params_path_from_env();
    let config = load_params(&params_path, required)?;

    let champion_path = std::env::var("LINKCAST_CHAMPION_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| config.data.champion_path.clone());

    let (descriptor, handle) = load_champion(&champion_path)?;
    log_champion_loaded(&descriptor.model_type, &descriptor.model_path, descriptor.version);

    let addr: SocketAddr = std::env::var("LINKCAST_SERVE_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let state = Arc::new(ServeState { descriptor, handle });
    let app = predict_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
