//! HTTP API for sending WhatsApp messages.
//!
//! Every route requires the shared API key, presented as the `apiKey` body
//! field, the `apiKey` query parameter, or the `x-api-key` header.

#[cfg(test)]
mod tests;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use warelay_core::{config::ServerMode, error::RelayError};
use warelay_sessions::InstanceRegistry;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    registry: InstanceRegistry,
    api_key: String,
    mode: ServerMode,
    /// Session used by `POST /send` in single-instance mode.
    default_identity: String,
    uptime: Instant,
}

impl ApiState {
    pub fn new(
        registry: InstanceRegistry,
        api_key: &str,
        mode: ServerMode,
        default_identity: &str,
    ) -> Self {
        Self {
            registry,
            api_key: api_key.to_string(),
            mode,
            default_identity: default_identity.to_string(),
            uptime: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyOnly {
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRequest {
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    number: Option<String>,
    message: Option<String>,
}

/// Constant-time string comparison to prevent timing attacks on the API key.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check the presented key. Returns `None` if authorized, `Some(response)` if rejected.
///
/// A key carried in the body or query wins over the `x-api-key` header.
fn check_auth(headers: &HeaderMap, presented: Option<&str>, api_key: &str) -> Option<ApiError> {
    let presented = presented.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
    });

    match presented {
        Some(key) if !api_key.is_empty() && constant_time_eq(key, api_key) => None,
        _ => {
            warn!("rejected request with missing or invalid API key");
            Some(error_response(&RelayError::Unauthorized))
        }
    }
}

fn error_response(err: &RelayError) -> ApiError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": err.to_string()})))
}

fn bad_request(message: &str) -> ApiError {
    error_response(&RelayError::BadRequest(message.to_string()))
}

/// Parse a JSON body. An empty body is treated as `{}`; malformed JSON yields `None`.
fn parse_body(body: &Bytes) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Some(json!({}));
    }
    serde_json::from_slice(body).ok()
}

/// Authenticate against the raw body, then decode the typed request.
///
/// The key is read before typed decoding so a mistyped field is a 400, not a 401.
fn authorize_body<T: DeserializeOwned>(
    state: &ApiState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, ApiError> {
    let parsed = parse_body(body);
    let presented = parsed
        .as_ref()
        .and_then(|value| value.get("apiKey"))
        .and_then(Value::as_str);
    if let Some(rejection) = check_auth(headers, presented, &state.api_key) {
        return Err(rejection);
    }

    let value = parsed.ok_or_else(|| bad_request("Invalid JSON body"))?;
    serde_json::from_value(value)
        .map_err(|e| bad_request(&format!("Invalid request body: {e}")))
}

fn required_fields(req: &SendRequest) -> Result<(&str, &str), ApiError> {
    let number = req.number.as_deref().map(str::trim).unwrap_or_default();
    let message = req.message.as_deref().unwrap_or_default();
    if number.is_empty() || message.is_empty() {
        return Err(bad_request("Number and message required"));
    }
    Ok((number, message))
}

/// `GET /health`: uptime and registry occupancy.
async fn health(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<KeyOnly>,
) -> ApiResult {
    if let Some(rejection) = check_auth(&headers, query.api_key.as_deref(), &state.api_key) {
        return Err(rejection);
    }

    Ok(Json(json!({
        "status": "ok",
        "mode": state.mode.as_str(),
        "uptimeSecs": state.uptime.elapsed().as_secs(),
        "instances": state.registry.len().await,
        "capacity": state.registry.capacity(),
    })))
}

/// `POST /instance`: provision a session and start its login flow.
///
/// A supplied `instanceId` re-provisions idempotently; otherwise a fresh
/// UUID is generated.
async fn create_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let req: InstanceRequest = authorize_body(&state, &headers, &body)?;

    let instance_id = req
        .instance_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    state
        .registry
        .create(&instance_id)
        .await
        .map_err(|e| error_response(&e))?;

    info!("instance {instance_id} provisioned");
    Ok(Json(json!({
        "instanceId": instance_id,
        "apiKey": state.api_key,
    })))
}

/// `GET /qr/{instance_id}`: latest login QR as a PNG data URL.
async fn qr(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<KeyOnly>,
) -> ApiResult {
    if let Some(rejection) = check_auth(&headers, query.api_key.as_deref(), &state.api_key) {
        return Err(rejection);
    }

    match state.registry.qr(&instance_id).await {
        Some(data_url) => Ok(Json(json!({"qr": data_url}))),
        None => Err(bad_request("QR code not available")),
    }
}

/// `GET /status/{instance_id}`
async fn status(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<KeyOnly>,
) -> ApiResult {
    if let Some(rejection) = check_auth(&headers, query.api_key.as_deref(), &state.api_key) {
        return Err(rejection);
    }

    let status = state
        .registry
        .status(&instance_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!(status)))
}

/// `POST /send/{instance_id}`
async fn send_instance(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let req: SendRequest = authorize_body(&state, &headers, &body)?;
    let (number, message) = required_fields(&req)?;

    state
        .registry
        .send(&instance_id, number, message)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({"success": true})))
}

/// `POST /send`: single-instance mode, through the implicit session.
async fn send_default(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let req: SendRequest = authorize_body(&state, &headers, &body)?;
    let (number, message) = required_fields(&req)?;

    // The implicit slot is gone only if its client failed; that is a server fault.
    let result = state
        .registry
        .send(&state.default_identity, number, message)
        .await
        .map_err(|e| match e {
            RelayError::NotFound(_) => {
                RelayError::SendFailed("WhatsApp client is not running".into())
            }
            other => other,
        });
    result.map_err(|e| error_response(&e))?;
    Ok(Json(json!({"success": true})))
}

/// `POST /logout/{instance_id}`: log out and forget the session.
async fn logout(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    authorize_body::<KeyOnly>(&state, &headers, &body)?;

    state
        .registry
        .logout(&instance_id)
        .await
        .map_err(|e| error_response(&e))?;

    info!("instance {instance_id} logged out");
    Ok(Json(json!({"success": true})))
}

/// Build the axum router for the configured mode.
pub fn build_router(state: ApiState) -> Router {
    let router = Router::new().route("/health", get(health));
    let router = match state.mode {
        ServerMode::Multi => router
            .route("/instance", post(create_instance))
            .route("/qr/{instance_id}", get(qr))
            .route("/status/{instance_id}", get(status))
            .route("/send/{instance_id}", post(send_instance))
            .route("/logout/{instance_id}", post(logout)),
        ServerMode::Single => router.route("/send", post(send_default)),
    };
    router
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let mode = state.mode;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind to {addr}: {e}"))?;

    info!("API server listening on {addr} ({} mode)", mode.as_str());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
