//! HTTP serving for the loaded champion.
//!
//! One operation: `POST /predict` with either a flat feature mapping or a
//! time-ordered window, depending on the champion's kind. Wrong payload
//! shape is a 400 with a structured error body, never a crash.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::champion::ChampionDescriptor;
use crate::predict::PredictorHandle;

pub struct ServeState {
    pub descriptor: ChampionDescriptor,
    pub handle: PredictorHandle,
}

#[derive(Debug, Deserialize)]
pub struct PredictPayload {
    #[serde(default)]
    pub features: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub window: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Serialize)]
struct ForecastResponse {
    forecast: f64,
}

pub fn predict_router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/predict", post(post_predict))
        .route("/health", get(get_health))
        .route("/model", get(get_model))
        .with_state(state)
}

async fn post_predict(
    State(state): State<Arc<ServeState>>,
    Json(payload): Json<PredictPayload>,
) -> Response {
    let kind = state.handle.kind();
    info!(
        component = "forecast_server",
        event = "http.predict.request",
        model_type = kind.as_str()
    );

    let outcome = match &state.handle {
        PredictorHandle::Tabular(predictor) => match payload.features {
            Some(features) => Ok(predictor.predict(&features)),
            None => Err(format!(
                "expected {{\"features\": {{...}}}} for the {} champion",
                kind.as_str()
            )),
        },
        PredictorHandle::Sequence(predictor) => match payload.window {
            Some(window) => predictor.predict(&window).map_err(|err| err.to_string()),
            None => Err(format!(
                "expected {{\"window\": [[...], ...]}} for the {} champion",
                kind.as_str()
            )),
        },
    };

    match outcome {
        Ok(forecast) => Json(ForecastResponse { forecast }).into_response(),
        Err(message) => {
            warn!(
                component = "forecast_server",
                event = "http.predict.rejected",
                model_type = kind.as_str(),
                reason = %message
            );
            validation_error(message)
        }
    }
}

async fn get_health(State(state): State<Arc<ServeState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "model_type": state.handle.kind().as_str(),
    }))
}

async fn get_model(State(state): State<Arc<ServeState>>) -> impl IntoResponse {
    Json(state.descriptor.clone())
}

fn validation_error(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
