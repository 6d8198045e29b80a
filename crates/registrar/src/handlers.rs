//! HTTP surface for the registrar.
//!
//! | Endpoint          | Method | Description                              |
//! |-------------------|--------|------------------------------------------|
//! | `/poll`           | POST   | Unified node heartbeat poll              |
//! | `/ndf`            | POST   | NDF poll (partial for clients)           |
//! | `/node/register`  | POST   | Node registration with a one-time code   |
//! | `/user/register`  | POST   | Client registration, returns a signature |
//! | `/client/version` | GET    | Expected client software version         |
//!
//! Caller identity comes from the wire transport; here it is carried in
//! the `x-node-id` / `x-dynamic-host` headers the transport shim sets.
//! Caller-attributable errors are returned verbatim as JSON; internal
//! errors collapse to a generic 500.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use mixnet_common::NodeId;
use mixnet_storage::StorageError;

use crate::error::RegistrarError;
use crate::poll::{AuthContext, Registrar};
use crate::wire::{PermissionPollResponse, PermissioningPoll};

/// Shared handler state.
pub struct AppState {
    pub registrar: Arc<Registrar>,
}

/// Request body for `/ndf`.
#[derive(Debug, Clone, Deserialize)]
pub struct PollNdfReq {
    #[serde(default)]
    pub hash: String,
}

/// Request body for `/node/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNodeReq {
    pub id: NodeId,
    pub server_address: String,
    pub server_tls_cert: String,
    pub gateway_address: String,
    pub gateway_tls_cert: String,
    pub registration_code: String,
    #[serde(default)]
    pub public_key: String,
}

/// Request body for `/user/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUserReq {
    pub registration_code: String,
    pub public_key: String,
}

/// Response body for `/user/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterUserResponse {
    /// Hex signature over SHA-256 of the submitted public key.
    pub signature: String,
}

fn auth_from_headers(headers: &HeaderMap) -> AuthContext {
    let node_id = headers
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| NodeId::from_hex(s).ok());
    let is_dynamic_host = headers
        .get("x-dynamic-host")
        .and_then(|v| v.to_str().ok())
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    AuthContext {
        node_id: node_id.unwrap_or(NodeId::new([0u8; 32])),
        is_authenticated: node_id.is_some(),
        is_dynamic_host,
    }
}

fn error_response(e: RegistrarError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        RegistrarError::NdfNotReady => StatusCode::SERVICE_UNAVAILABLE,
        RegistrarError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        RegistrarError::UnknownNode(_) => StatusCode::NOT_FOUND,
        RegistrarError::Banned(_) => StatusCode::FORBIDDEN,
        RegistrarError::VersionIncompatible { .. }
        | RegistrarError::BadError(_)
        | RegistrarError::PortFailed(_)
        | RegistrarError::IllegalTransition { .. }
        | RegistrarError::OrphanActivity { .. }
        | RegistrarError::BadOrdering(_) => StatusCode::BAD_REQUEST,
        RegistrarError::Storage(StorageError::InvalidCode(_))
        | RegistrarError::Storage(StorageError::Duplicate(_))
        | RegistrarError::Storage(StorageError::NotFound(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        // Internal details stay in the log.
        error!(error = %e, "internal error");
        return (status, Json(json!({"error": "internal failure"})));
    }
    (status, Json(json!({"error": e.to_string()})))
}

/// POST /poll
pub async fn poll_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PermissioningPoll>,
) -> Result<Json<PermissionPollResponse>, (StatusCode, Json<Value>)> {
    let auth = auth_from_headers(&headers);
    state
        .registrar
        .poll(payload, &auth)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /ndf
pub async fn poll_ndf_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PollNdfReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let auth = auth_from_headers(&headers);
    state
        .registrar
        .poll_ndf(&payload.hash, &auth)
        .map(|ndf| Json(json!({ "ndf": ndf })))
        .map_err(error_response)
}

/// POST /node/register
pub async fn register_node_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterNodeReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .registrar
        .register_node(
            payload.id,
            &payload.server_address,
            &payload.server_tls_cert,
            &payload.gateway_address,
            &payload.gateway_tls_cert,
            &payload.registration_code,
            &payload.public_key,
        )
        .map(|_| Json(json!({"ok": true})))
        .map_err(error_response)
}

/// POST /user/register
pub async fn register_user_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterUserReq>,
) -> Result<Json<RegisterUserResponse>, (StatusCode, Json<Value>)> {
    state
        .registrar
        .register_user(&payload.registration_code, &payload.public_key)
        .map(|signature| {
            Json(RegisterUserResponse {
                signature: hex::encode(signature),
            })
        })
        .map_err(error_response)
}

/// GET /client/version
pub async fn client_version_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "version": state.registrar.current_client_version() }))
}

/// Build the registrar's router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/poll", post(poll_handler))
        .route("/ndf", post(poll_ndf_handler))
        .route("/node/register", post(register_node_handler))
        .route("/user/register", post(register_user_handler))
        .route("/client/version", get(client_version_handler))
}
