use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::credentials::{CredentialBroker, CredentialRecord, Resolution};
use crate::error::AgentError;
use crate::orchestrator::Orchestrator;

/// One signing request as posted by the remote backend's client module.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningRequest {
    pub batch: i64,
    pub url: String,
    pub database: String,
    pub token: String,
}

/// Body for the credential adapter endpoints.
#[derive(Debug, Deserialize)]
pub struct CredentialSubmission {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub certificate_password: String,
    #[serde(default)]
    pub certificate_path: Option<String>,
    #[serde(default)]
    pub use_hardware_token: bool,
}

#[derive(Debug, Deserialize)]
pub struct CredentialCancellation {
    pub url: String,
}

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<CredentialBroker>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", post(sign_handler))
        .route(
            "/credentials",
            post(store_credentials_handler).delete(clear_credentials_handler),
        )
        .route("/credentials/cancel", post(cancel_credentials_handler))
        .with_state(state)
}

pub async fn run(host: String, port: u16, state: AppState) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, "listening");

    axum::serve(listener, router(state))
        .await
        .context("server terminated")?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "running"})))
}

/// Accepts a batch for signing. Replies as soon as credentials are settled;
/// the batch itself runs in a background task.
async fn sign_handler(
    State(state): State<AppState>,
    request: Result<Json<SigningRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AgentError> {
    let Json(request) = request.map_err(|e| AgentError::MalformedRequest(e.body_text()))?;

    tracing::info!(
        batch_id = request.batch,
        url = %request.url,
        database = %request.database,
        "signing request received"
    );

    let credentials = match state.broker.resolve(&request.url, &request.database).await {
        Resolution::Ready(credentials) => credentials,
        Resolution::Cancelled => return Err(AgentError::UserCancelled),
        Resolution::TimedOut => return Err(AgentError::CredentialsRequired),
    };

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.run_and_report(request, credentials).await;
    });

    Ok((StatusCode::OK, Json(json!({"status": "processing"}))))
}

async fn store_credentials_handler(
    State(state): State<AppState>,
    submission: Result<Json<CredentialSubmission>, JsonRejection>,
) -> Result<impl IntoResponse, AgentError> {
    let Json(submission) = submission.map_err(|e| AgentError::MalformedRequest(e.body_text()))?;

    let record = CredentialRecord {
        username: submission.username,
        password: submission.password,
        certificate_password: submission.certificate_password,
        certificate_path: submission.certificate_path,
        use_hardware_token: submission.use_hardware_token,
    };
    state.broker.store(&submission.url, record);

    Ok((StatusCode::OK, Json(json!({"status": "stored"}))))
}

async fn cancel_credentials_handler(
    State(state): State<AppState>,
    cancellation: Result<Json<CredentialCancellation>, JsonRejection>,
) -> Result<impl IntoResponse, AgentError> {
    let Json(cancellation) =
        cancellation.map_err(|e| AgentError::MalformedRequest(e.body_text()))?;

    state.broker.cancel(&cancellation.url);

    Ok((StatusCode::OK, Json(json!({"status": "cancelled"}))))
}

async fn clear_credentials_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.broker.clear_all();
    (StatusCode::OK, Json(json!({"status": "cleared"})))
}
