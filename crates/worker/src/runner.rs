use std::path::{Path, PathBuf};

use sign_protocol::{self as protocol, DocumentResult, SigningJobSpec, WorkerOutput, WorkerStatus};

use crate::signer::{PdfSigner, SignerError};

/// Factory the runner uses to open the signing backend once per run.
/// Injected so tests can substitute a backend without touching real
/// certificates or external tools.
pub type BackendFactory<'a> =
    &'a dyn Fn(&SigningJobSpec, &Path) -> Result<Box<dyn PdfSigner>, SignerError>;

/// Drives one signing run inside the working directory.
pub struct Worker {
    work_dir: PathBuf,
}

impl Worker {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Runs the job to completion and returns the process exit code.
    ///
    /// Every failure path ends in a terminal `status.json` rather than a
    /// panic; the parent learns about problems by polling, never by this
    /// process crashing silently.
    pub fn run(&self, open_backend: BackendFactory<'_>) -> i32 {
        self.set_status(WorkerStatus::working(0, 0, "loading job descriptor"));

        let job = match protocol::load_job(&self.work_dir) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "failed to load job descriptor");
                self.set_status(WorkerStatus::error(format!("invalid job descriptor: {e}")));
                return 1;
            }
        };

        if job.documents.is_empty() {
            self.set_status(WorkerStatus::error("no documents to sign"));
            return 1;
        }

        let total = job.documents.len() as u32;
        tracing::info!(
            documents = total,
            hardware_token = job.use_hardware_token,
            "starting signing run"
        );

        self.set_status(WorkerStatus::working(0, total, "initializing signing backend"));

        // Backend setup failures are terminal: a bad certificate or missing
        // PKCS#11 module will not get better on the second document.
        let mut backend = match open_backend(&job, &self.work_dir) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!(error = %e, "signing backend setup failed");
                self.set_status(WorkerStatus::error(e.to_string()));
                return 1;
            }
        };

        let mut results = Vec::with_capacity(job.documents.len());

        for (index, doc) in job.documents.iter().enumerate() {
            let position = index as u32 + 1;
            self.set_status(WorkerStatus::working(
                position,
                total,
                format!("signing {}", doc.filename),
            ));

            match self.sign_one(backend.as_mut(), doc.document_id) {
                Ok(signed_name) => {
                    tracing::info!(document_id = doc.document_id, file = %doc.filename, "signed");
                    results.push(DocumentResult::signed(
                        doc.document_id,
                        &doc.remote_model,
                        doc.remote_record_id,
                        &signed_name,
                        &doc.filename,
                    ));
                }
                Err(e) => {
                    tracing::error!(
                        document_id = doc.document_id,
                        file = %doc.filename,
                        error = %e,
                        "signing failed"
                    );
                    results.push(DocumentResult::failed(
                        doc.document_id,
                        &doc.filename,
                        e.to_string(),
                    ));
                }
            }
        }

        if let Err(e) = backend.close() {
            tracing::warn!(error = %e, "error releasing signing backend");
        }

        let signed_count = results.iter().filter(|r| r.success).count();

        if let Err(e) = protocol::store_output(&self.work_dir, &WorkerOutput { results }) {
            tracing::error!(error = %e, "failed to write results");
            self.set_status(WorkerStatus::error(format!("failed to write results: {e}")));
            return 1;
        }

        if signed_count > 0 {
            self.set_status(WorkerStatus::success(
                total,
                format!("signed {signed_count} of {total} documents"),
            ));
            0
        } else {
            self.set_status(WorkerStatus::error("no documents were signed"));
            1
        }
    }

    fn sign_one(&self, backend: &mut dyn PdfSigner, document_id: i64) -> Result<String, SignerError> {
        let unsigned = protocol::unsigned_path(&self.work_dir, document_id);
        if !unsigned.is_file() {
            return Err(SignerError::Certificate(format!(
                "staged file missing: {}",
                unsigned.display()
            )));
        }

        let pdf = std::fs::read(&unsigned)?;
        let signed = backend.sign(&pdf)?;

        let signed_file = protocol::signed_path(&self.work_dir, document_id);
        std::fs::write(&signed_file, signed)?;

        Ok(signed_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    // Status write failures are logged and swallowed: losing one snapshot
    // is recoverable, dying here would lose the whole run.
    fn set_status(&self, status: WorkerStatus) {
        if let Err(e) = protocol::store_status(&self.work_dir, &status) {
            tracing::error!(error = %e, "failed to update status file");
        }
    }
}
