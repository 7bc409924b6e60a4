use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use health::{HealthRegistry, HealthStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::client::Bar;
use crate::config::Tokens;
use crate::dal::FooDal;
use crate::metrics::track_metrics;

#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub version: &'static str,
    pub tokens: Tokens,
    pub health: HealthRegistry,
    pub foo: Arc<FooDal>,
}

/// Body of every non-data response.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonStatus {
    pub status: String,
    pub message: String,
}

impl JsonStatus {
    fn new(status: &str, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: status.to_owned(),
            message: message.into(),
        })
    }
}

type ApiError = (StatusCode, Json<JsonStatus>);

#[derive(Serialize)]
struct HealthcheckResponse<'a> {
    #[serde(flatten)]
    health: &'a HealthStatus,
    version: &'a str,
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/version", routing::get(version))
        .route("/healthcheck", routing::get(healthcheck))
        .route("/v1/bar/:id", routing::get(get_bar))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Json<JsonStatus> {
    JsonStatus::new(
        "Oh, hello there!",
        format!("Refer to README.md for {} API usage", state.service_name),
    )
}

async fn version(State(state): State<AppState>) -> Json<JsonStatus> {
    JsonStatus::new(
        "version",
        format!("{} {}", state.service_name, state.version),
    )
}

async fn healthcheck(State(state): State<AppState>) -> Response {
    let health = state.health.get_status();
    let body = HealthcheckResponse {
        health: &health,
        version: state.version,
    };
    (health.status_code(), Json(body)).into_response()
}

async fn get_bar(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Json<Bar>, ApiError> {
    authorize(&headers, &state.tokens)?;

    let bar = state.foo.get_bar(id).await.map_err(|err| {
        error!(id, "failed to get bar: {}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            JsonStatus::new("error", "unable to get bar"),
        )
    })?;

    Ok(Json(bar))
}

fn authorize(headers: &HeaderMap, tokens: &Tokens) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token {
        Some(token) if tokens.contains(token) => Ok(()),
        Some(_) => {
            warn!("rejected request with an unknown token");
            Err((
                StatusCode::UNAUTHORIZED,
                JsonStatus::new("error", "invalid token"),
            ))
        }
        None => Err((
            StatusCode::UNAUTHORIZED,
            JsonStatus::new("error", "missing bearer token"),
        )),
    }
}
