use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::header::{HeaderName, AUTHORIZATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::dose::SoundDoseManager;
use crate::error::{DoseError, ErrorCode};
use crate::types::SoundDoseRecord;

use super::sse;

/// Shared application state for HTTP handlers.
#[derive(Clone)]
pub struct DoseHttpState {
    pub manager: Arc<SoundDoseManager>,
    token: Arc<String>,
}

impl DoseHttpState {
    pub fn new(manager: Arc<SoundDoseManager>, token: String) -> Self {
        Self {
            manager,
            token: Arc::new(token),
        }
    }

    fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<(), HttpServerError> {
        let provided = extract_token(headers, query_token);
        match provided {
            Some(value) if value == *self.token => Ok(()),
            _ => Err(HttpServerError::Unauthorized),
        }
    }
}

/// Query payload for extracting token from URL.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    pub token: Option<String>,
}

/// HTTP error variants mapped to JSON responses.
#[derive(Debug)]
pub enum HttpServerError {
    Unauthorized,
    BadRequest(&'static str),
    Dose(DoseError),
}

impl From<DoseError> for HttpServerError {
    fn from(err: DoseError) -> Self {
        Self::Dose(err)
    }
}

impl IntoResponse for HttpServerError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "missing or invalid token" }),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            Self::Dose(err) => {
                let status = match err {
                    DoseError::InvalidArgument { .. } | DoseError::ConfigInvalid { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    DoseError::InterfaceRevoked => StatusCode::CONFLICT,
                    DoseError::LockPoisoned { .. } | DoseError::ProcessorCreationFailed { .. } => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (
                    status,
                    serde_json::json!({ "error": err.message(), "code": err.code() }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Health endpoint response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_processors: usize,
    pub listener_registered: bool,
}

/// RS2 threshold payload, used for both reads and updates.
#[derive(Debug, Serialize, Deserialize)]
pub struct Rs2Payload {
    pub rs2: f32,
}

/// Current dose and the records retained in the window.
#[derive(Debug, Serialize, Deserialize)]
pub struct CsdPayload {
    pub csd: f32,
    #[serde(default)]
    pub records: Vec<SoundDoseRecord>,
}

/// Mode toggles; absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct ModesPatch {
    pub use_framework_mel: Option<bool>,
    pub compute_csd_on_all_devices: Option<bool>,
}

/// Mode state after a patch.
#[derive(Debug, Serialize)]
pub struct ModesResponse {
    pub use_framework_mel: bool,
    pub compute_csd_on_all_devices: bool,
}

/// Build the Axum router with all handlers.
pub fn build_router(state: DoseHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rs2", get(get_rs2).post(set_rs2))
        .route("/csd", get(get_csd))
        .route("/csd/reset", post(reset_csd))
        .route("/modes", post(apply_modes))
        .route("/dump", get(dump))
        .route("/events", get(events_handler))
        .with_state(state)
}

/// Run the HTTP server loop.
pub async fn run_http_server(state: DoseHttpState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding sound dose HTTP listener")?;
    let router = build_router(state);
    axum::serve(listener, router)
        .await
        .context("serving sound dose HTTP router")?;
    Ok(())
}

pub async fn health(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    Ok(Json(HealthResponse {
        status: "ok",
        active_processors: state.manager.active_processor_count(),
        listener_registered: state.manager.has_listener(),
    }))
}

pub async fn get_rs2(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<Rs2Payload>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    Ok(Json(Rs2Payload {
        rs2: state.manager.output_rs2()?,
    }))
}

pub async fn set_rs2(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(payload): Json<Rs2Payload>,
) -> Result<Json<Rs2Payload>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    state.manager.set_output_rs2(payload.rs2)?;
    Ok(Json(Rs2Payload {
        rs2: state.manager.output_rs2()?,
    }))
}

pub async fn get_csd(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<CsdPayload>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    let (csd, records) = state.manager.snapshot();
    Ok(Json(CsdPayload { csd, records }))
}

pub async fn reset_csd(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(payload): Json<CsdPayload>,
) -> Result<Json<CsdPayload>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    if !payload.csd.is_finite() || payload.csd < 0.0 {
        return Err(HttpServerError::BadRequest(
            "csd must be a non-negative number",
        ));
    }

    state.manager.reset_csd(payload.csd, &payload.records);
    let (csd, records) = state.manager.snapshot();
    Ok(Json(CsdPayload { csd, records }))
}

pub async fn apply_modes(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(patch): Json<ModesPatch>,
) -> Result<Json<ModesResponse>, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;

    if patch.use_framework_mel.is_none() && patch.compute_csd_on_all_devices.is_none() {
        return Err(HttpServerError::BadRequest(
            "at least one mode must be provided",
        ));
    }

    if let Some(use_framework_mel) = patch.use_framework_mel {
        state.manager.set_use_framework_mel(use_framework_mel)?;
    }
    if let Some(all_devices) = patch.compute_csd_on_all_devices {
        state.manager.set_compute_csd_on_all_devices(all_devices)?;
    }

    Ok(Json(ModesResponse {
        use_framework_mel: state.manager.use_framework_mel(),
        compute_csd_on_all_devices: state.manager.compute_csd_on_all_devices(),
    }))
}

pub async fn dump(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<String, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;
    Ok(state.manager.dump())
}

pub async fn events_handler(
    State(state): State<DoseHttpState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<sse::DoseEventStream, HttpServerError> {
    state.authorize(&headers, query.token.as_deref())?;
    sse::dose_events(&state.manager)
}

fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        return Some(token.to_string());
    }

    static X_DEBUG_TOKEN: HeaderName = HeaderName::from_static("x-debug-token");

    headers
        .get(&X_DEBUG_TOKEN)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|raw| raw.strip_prefix("Bearer ").map(|v| v.to_string()))
        })
}
