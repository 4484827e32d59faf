use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::credentials::CredentialRecord;
use crate::server::SigningRequest;

const RPC_TIMEOUT: Duration = Duration::from_secs(60);
const BATCH_MODEL: &str = "signature.batch";
const DOCUMENT_MODEL: &str = "signature.batch.document";

/// Remote-side failures, split by recovery policy: connection problems are
/// transport-level, authentication purges cached credentials, token problems
/// abort without touching remote state.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("session token rejected: {0}")]
    Token(String),
    #[error("batch {0} not found")]
    BatchNotFound(i64),
    #[error("batch {0} is already fully signed")]
    BatchAlreadySigned(i64),
    #[error("unexpected remote response: {0}")]
    Protocol(String),
}

/// A document fetched from the remote batch, ready to stage for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedDocument {
    pub document_id: i64,
    pub filename: String,
    pub remote_model: String,
    pub remote_record_id: i64,
    pub pdf_bytes: Vec<u8>,
}

/// A signed document ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub document_id: i64,
    pub remote_model: String,
    pub remote_record_id: i64,
    pub signed_filename: String,
    pub signed_pdf_bytes: Vec<u8>,
}

/// Terminal batch state reported back to the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Done,
    Error,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Done => "done",
            BatchState::Error => "error",
        }
    }
}

/// The calls the orchestrator makes against the remote document-management
/// backend. One instance per signing run, bound to a URL, database, user
/// and single-use batch token.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn authenticate(&mut self) -> Result<(), RemoteError>;
    async fn validate_batch_token(&self, batch_id: i64) -> Result<(), RemoteError>;
    async fn download_unsigned(&self, batch_id: i64) -> Result<Vec<UnsignedDocument>, RemoteError>;
    async fn upload_signed(&self, document: &SignedDocument) -> Result<(), RemoteError>;
    async fn finalize_batch(&self, batch_id: i64, state: BatchState) -> Result<(), RemoteError>;
}

/// Creates a backend for one signing run. Injected into the orchestrator so
/// tests can substitute a recording fake.
pub trait RemoteBackendFactory: Send + Sync {
    fn connect(
        &self,
        request: &SigningRequest,
        credentials: &CredentialRecord,
    ) -> Box<dyn RemoteBackend>;
}

/// JSON-RPC 2.0 client for an Odoo-style backend (`POST {url}/jsonrpc`,
/// services `common` and `object`).
pub struct JsonRpcBackend {
    http: reqwest::Client,
    url: String,
    database: String,
    username: String,
    password: String,
    batch_token: String,
    uid: Option<i64>,
    call_id: AtomicU64,
}

impl JsonRpcBackend {
    pub fn new(
        url: &str,
        database: &str,
        username: &str,
        password: &str,
        batch_token: &str,
    ) -> Self {
        // Builder failure means a broken TLS backend, never bad input.
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("failed to construct HTTP client");
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            batch_token: batch_token.to_string(),
            uid: None,
            call_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, RemoteError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args,
            },
            "id": self.call_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http
            .post(format!("{}/jsonrpc", self.url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| RemoteError::Connection(e.to_string()))?;

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("data")
                .and_then(|d| d.get("message"))
                .or_else(|| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown remote fault");
            return Err(RemoteError::Protocol(message.to_string()));
        }

        Ok(body
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// `execute_kw` against a model method; requires prior authentication.
    async fn execute(&self, model: &str, method: &str, args: Value) -> Result<Value, RemoteError> {
        let uid = self
            .uid
            .ok_or_else(|| RemoteError::Authentication("not authenticated".into()))?;

        self.call(
            "object",
            "execute_kw",
            json!([
                self.database,
                uid,
                self.password,
                model,
                method,
                args,
                {},
            ]),
        )
        .await
    }
}

#[async_trait]
impl RemoteBackend for JsonRpcBackend {
    async fn authenticate(&mut self) -> Result<(), RemoteError> {
        let result = self
            .call(
                "common",
                "authenticate",
                json!([self.database, self.username, self.password, {}]),
            )
            .await?;

        match result.as_i64() {
            Some(uid) if uid > 0 => {
                tracing::info!(uid, url = %self.url, "authenticated against remote backend");
                self.uid = Some(uid);
                Ok(())
            }
            // The backend reports bad credentials as `false`, not a fault.
            _ => Err(RemoteError::Authentication(format!(
                "invalid credentials for {} on {}",
                self.username, self.database
            ))),
        }
    }

    async fn validate_batch_token(&self, batch_id: i64) -> Result<(), RemoteError> {
        if self.batch_token.is_empty() {
            return Err(RemoteError::Token("no session token provided".into()));
        }

        let result = self
            .execute(
                BATCH_MODEL,
                "validate_session_token",
                json!([[batch_id], self.batch_token]),
            )
            .await?;

        parse_token_validation(&result)
    }

    async fn download_unsigned(&self, batch_id: i64) -> Result<Vec<UnsignedDocument>, RemoteError> {
        tracing::info!(batch_id, "downloading unsigned documents");

        let batches = self
            .execute(
                BATCH_MODEL,
                "read",
                json!([[batch_id], ["name", "document_ids", "state"]]),
            )
            .await?;

        let batch = batches
            .as_array()
            .and_then(|b| b.first())
            .ok_or(RemoteError::BatchNotFound(batch_id))?;

        if batch.get("state").and_then(Value::as_str) == Some("done") {
            return Err(RemoteError::BatchAlreadySigned(batch_id));
        }

        let document_ids: Vec<i64> = batch
            .get("document_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        if document_ids.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self
            .execute(
                DOCUMENT_MODEL,
                "read",
                json!([
                    document_ids,
                    ["id", "filename", "state", "res_model", "res_id", "pdf_content"],
                ]),
            )
            .await?;

        let rows = documents
            .as_array()
            .ok_or_else(|| RemoteError::Protocol("document read returned no list".into()))?;

        Ok(parse_unsigned_documents(rows))
    }

    async fn upload_signed(&self, document: &SignedDocument) -> Result<(), RemoteError> {
        let payload = BASE64.encode(&document.signed_pdf_bytes);
        let sign_date = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

        self.execute(
            DOCUMENT_MODEL,
            "write",
            json!([
                [document.document_id],
                {
                    "signed_pdf": payload,
                    "signed_pdf_filename": document.signed_filename,
                    "state": "signed",
                    "sign_date": sign_date,
                },
            ]),
        )
        .await?;

        tracing::debug!(
            document_id = document.document_id,
            file = %document.signed_filename,
            "uploaded signed document"
        );
        Ok(())
    }

    async fn finalize_batch(&self, batch_id: i64, state: BatchState) -> Result<(), RemoteError> {
        // Re-validate before the final write so a relaunched session cannot
        // race a post-expiry state change.
        self.validate_batch_token(batch_id).await?;

        self.execute(
            BATCH_MODEL,
            "write",
            json!([[batch_id], {"state": state.as_str()}]),
        )
        .await?;

        tracing::info!(batch_id, state = state.as_str(), "batch finalized");
        Ok(())
    }
}

fn parse_token_validation(result: &Value) -> Result<(), RemoteError> {
    match result.get("valid").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        Some(false) => {
            let reason = result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("token invalid or expired");
            Err(RemoteError::Token(reason.to_string()))
        }
        None => Err(RemoteError::Protocol(
            "token validation returned no verdict".into(),
        )),
    }
}

/// Maps raw document rows to [`UnsignedDocument`]s, skipping anything that
/// cannot be signed: already-signed documents (idempotent re-runs), rows
/// without content, and rows whose payload does not decode.
fn parse_unsigned_documents(rows: &[Value]) -> Vec<UnsignedDocument> {
    let mut documents = Vec::new();

    for row in rows {
        let document_id = row.get("id").and_then(Value::as_i64).unwrap_or_default();

        if row.get("state").and_then(Value::as_str) == Some("signed") {
            tracing::debug!(document_id, "already signed server-side, skipping");
            continue;
        }

        let Some(content) = row.get("pdf_content").and_then(Value::as_str) else {
            tracing::warn!(document_id, "document has no PDF content, skipping");
            continue;
        };
        if content.is_empty() {
            tracing::warn!(document_id, "document has empty PDF content, skipping");
            continue;
        }

        let pdf_bytes = match BASE64.decode(content) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(document_id, error = %e, "PDF payload is not valid base64, skipping");
                continue;
            }
        };

        documents.push(UnsignedDocument {
            document_id,
            filename: row
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            remote_model: row
                .get("res_model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            remote_record_id: row.get("res_id").and_then(Value::as_i64).unwrap_or_default(),
            pdf_bytes,
        });
    }

    documents
}

/// Default factory: one [`JsonRpcBackend`] per signing run.
pub struct JsonRpcBackendFactory;

impl RemoteBackendFactory for JsonRpcBackendFactory {
    fn connect(
        &self,
        request: &SigningRequest,
        credentials: &CredentialRecord,
    ) -> Box<dyn RemoteBackend> {
        Box::new(JsonRpcBackend::new(
            &request.url,
            &request.database,
            &credentials.username,
            &credentials.password,
            &request.token,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, state: &str, content: Option<&str>) -> Value {
        json!({
            "id": id,
            "filename": format!("doc_{id}.pdf"),
            "state": state,
            "res_model": "account.move",
            "res_id": 100 + id,
            "pdf_content": content,
        })
    }

    #[test]
    fn skips_documents_already_signed_server_side() {
        let payload = BASE64.encode(b"%PDF-1.4");
        let rows = vec![
            row(1, "unsigned", Some(payload.as_str())),
            row(2, "signed", Some(payload.as_str())),
            row(3, "unsigned", Some(payload.as_str())),
        ];

        let documents = parse_unsigned_documents(&rows);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].document_id, 1);
        assert_eq!(documents[1].document_id, 3);
    }

    #[test]
    fn decodes_base64_payloads() {
        let original = b"%PDF-1.4 real content";
        let payload = BASE64.encode(original);
        let rows = vec![row(1, "unsigned", Some(payload.as_str()))];

        let documents = parse_unsigned_documents(&rows);
        assert_eq!(documents[0].pdf_bytes, original);
        assert_eq!(documents[0].remote_model, "account.move");
        assert_eq!(documents[0].remote_record_id, 101);
    }

    #[test]
    fn skips_documents_without_content() {
        let payload = BASE64.encode(b"content");
        let rows = vec![
            row(1, "unsigned", Some(payload.as_str())),
            row(2, "unsigned", None),
            row(3, "unsigned", Some("")),
        ];

        let documents = parse_unsigned_documents(&rows);
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].document_id, 1);
    }

    #[test]
    fn invalid_base64_does_not_abort_the_batch() {
        let payload = BASE64.encode(b"ok");
        let rows = vec![
            row(1, "unsigned", Some(payload.as_str())),
            row(2, "unsigned", Some("not//valid base64!!!")),
        ];

        let documents = parse_unsigned_documents(&rows);
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].document_id, 1);
    }

    #[test]
    fn backend_construction_normalizes_the_url() {
        let backend = JsonRpcBackend::new("https://erp.example.com/", "db", "u", "pw", "tok");
        assert_eq!(backend.url, "https://erp.example.com");
    }

    #[test]
    fn valid_token_verdict_passes() {
        assert!(parse_token_validation(&json!({"valid": true})).is_ok());
    }

    #[test]
    fn invalid_token_verdict_carries_the_reason() {
        let err = parse_token_validation(&json!({"valid": false, "error": "token expired"}))
            .err()
            .unwrap();
        match err {
            RemoteError::Token(reason) => assert_eq!(reason, "token expired"),
            other => panic!("expected Token error, got {other:?}"),
        }
    }

    #[test]
    fn missing_verdict_is_a_protocol_error() {
        let err = parse_token_validation(&json!({})).err().unwrap();
        assert!(matches!(err, RemoteError::Protocol(_)));
    }

    #[test]
    fn batch_states_serialize_to_remote_values() {
        assert_eq!(BatchState::Done.as_str(), "done");
        assert_eq!(BatchState::Error.as_str(), "error");
    }
}
