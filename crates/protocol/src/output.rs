use serde::{Deserialize, Serialize};

/// Per-document outcome in the worker's final results listing.
///
/// The listing always has one entry per document in the job, successful or
/// not; the agent decides what to do with the failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentResult {
    pub document_id: i64,
    #[serde(default)]
    pub remote_model: String,
    #[serde(default)]
    pub remote_record_id: i64,
    /// Name of the `signed_<id>.pdf` file, present only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_filename: Option<String>,
    pub original_filename: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `output.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub results: Vec<DocumentResult>,
}

impl DocumentResult {
    pub fn signed(doc_id: i64, model: &str, record_id: i64, signed: &str, original: &str) -> Self {
        Self {
            document_id: doc_id,
            remote_model: model.to_string(),
            remote_record_id: record_id,
            signed_filename: Some(signed.to_string()),
            original_filename: original.to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failed(doc_id: i64, original: &str, error: impl Into<String>) -> Self {
        Self {
            document_id: doc_id,
            remote_model: String::new(),
            remote_record_id: 0,
            signed_filename: None,
            original_filename: original.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}
