use axum::Json;
use axum::http::StatusCode;
use axum_core::response::{IntoResponse as AxumCoreIntoResponse, Response};
use serde_json::json;

use crate::manager::ManagerError;
use crate::remote::RemoteError;

/// Batch-run and request-handling errors surfaced by the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("malformed signing request: {0}")]
    MalformedRequest(String),
    #[error("credentials could not be obtained in time")]
    CredentialsRequired,
    #[error("user cancelled the credential prompt")]
    UserCancelled,
    #[error("batch {0} has no unsigned documents")]
    EmptyBatch(i64),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Signing(#[from] ManagerError),
}

/// 499 is the de-facto "client closed request" code; here it marks an
/// explicit user cancellation, distinct from a credential timeout.
fn user_cancelled_status() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is a valid status code")
}

/// Trait implementation to convert this error into an axum http response
impl AxumCoreIntoResponse for AgentError {
    fn into_response(self) -> Response {
        match self {
            AgentError::CredentialsRequired => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "credentials_required"})),
            )
                .into_response(),
            AgentError::UserCancelled => (
                user_cancelled_status(),
                Json(json!({"error": "user_cancelled"})),
            )
                .into_response(),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": other.to_string()})),
            )
                .into_response(),
        }
    }
}
