use serde::{Deserialize, Serialize};

/// One document entry in the job descriptor.
///
/// Carries only metadata; the PDF bytes themselves are staged as
/// `unsigned_<id>.pdf` files next to the descriptor so the JSON payload
/// stays small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: i64,
    #[serde(default)]
    pub remote_model: String,
    #[serde(default)]
    pub remote_record_id: i64,
    pub filename: String,
}

/// The job descriptor the agent writes to `input.json` before launching
/// the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningJobSpec {
    /// Path to a PKCS#12 certificate bundle. Unused when signing with a
    /// hardware token.
    pub certificate_path: Option<String>,
    /// Certificate passphrase, or hardware-token PIN.
    pub certificate_password: String,
    /// Sign with a PKCS#11 hardware token instead of a file certificate.
    pub use_hardware_token: bool,
    /// Explicit PKCS#11 module path. When absent the worker probes the
    /// `PKCS11_MODULE` environment variable and well-known locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs11_module: Option<String>,
    /// External signing command the worker delegates each document to.
    /// When absent the worker falls back to its built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_command: Option<String>,
    /// Documents to sign, in order.
    pub documents: Vec<DocumentRef>,
}
