use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use sign_protocol::{self as protocol, DocumentRef, SigningJobSpec, WorkerPhase, WorkerStatus};

use crate::credentials::CredentialRecord;
use crate::remote::{SignedDocument, UnsignedDocument};

/// Progress callback: (progress, total, message).
pub type ProgressFn = Arc<dyn Fn(u32, u32, &str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("failed to stage signing run: {0}")]
    Staging(String),
    #[error("failed to launch worker: {0}")]
    Spawn(std::io::Error),
    #[error("worker unresponsive after {0:?}, terminated")]
    Timeout(Duration),
    #[error("worker reported failure: {0}")]
    WorkerFailed(String),
}

/// Configuration for one [`SubprocessManager`]. All timing knobs are
/// injected; nothing here is a hidden constant.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path to the worker executable.
    pub worker_path: PathBuf,
    /// How often to re-read the worker's status file.
    pub poll_interval: Duration,
    /// Overall ceiling for one signing run.
    pub timeout: Duration,
    /// How long to wait for the worker to exit after a terminal status.
    pub exit_grace: Duration,
    /// Retain the working directory after the run, for diagnostics.
    pub keep_work_dir: bool,
    /// Root under which per-run working directories are created. `None`
    /// uses the system temp directory.
    pub work_root: Option<PathBuf>,
    /// External signing command handed to the worker.
    pub signing_command: Option<String>,
    /// Explicit PKCS#11 module path handed to the worker.
    pub pkcs11_module: Option<String>,
}

impl ManagerConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(300),
            exit_grace: Duration::from_secs(10),
            keep_work_dir: false,
            work_root: None,
            signing_command: None,
            pkcs11_module: None,
        }
    }
}

/// Seam the orchestrator uses to run a signing pass. Implemented by the
/// real subprocess manager; tests substitute a fake.
#[async_trait]
pub trait DocumentSigning: Send + Sync {
    async fn sign_documents(
        &self,
        documents: &[UnsignedDocument],
        credentials: &CredentialRecord,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<SignedDocument>, ManagerError>;
}

/// Runs one cryptographic signing pass per batch in a separate process.
///
/// The process boundary is the whole point: a crash or a blocking
/// hardware-token call inside the worker cannot take down request handling
/// in the agent. Coordination is a polled status file, which tolerates the
/// worker dying without warning: the manager simply observes a stale
/// status and times out.
pub struct SubprocessManager {
    config: ManagerConfig,
}

impl SubprocessManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self { config }
    }

    /// Stages the documents into a fresh private working directory.
    fn prepare_work_dir(&self, documents: &[UnsignedDocument]) -> Result<TempDir, ManagerError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sign-agent-");
        let work_dir = match &self.config.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| ManagerError::Staging(e.to_string()))?;

        tracing::info!(dir = %work_dir.path().display(), "staging signing run");

        for doc in documents {
            let path = protocol::unsigned_path(work_dir.path(), doc.document_id);
            // Staging failure drops the TempDir, which removes everything
            // written so far.
            std::fs::write(&path, &doc.pdf_bytes)
                .map_err(|e| ManagerError::Staging(format!("{}: {e}", path.display())))?;
        }

        Ok(work_dir)
    }

    fn build_job(&self, documents: &[UnsignedDocument], credentials: &CredentialRecord) -> SigningJobSpec {
        SigningJobSpec {
            certificate_path: credentials.certificate_path.clone(),
            certificate_password: credentials.certificate_password.clone(),
            use_hardware_token: credentials.use_hardware_token,
            pkcs11_module: self.config.pkcs11_module.clone(),
            signing_command: self.config.signing_command.clone(),
            documents: documents
                .iter()
                .map(|doc| DocumentRef {
                    document_id: doc.document_id,
                    remote_model: doc.remote_model.clone(),
                    remote_record_id: doc.remote_record_id,
                    filename: doc.filename.clone(),
                })
                .collect(),
        }
    }

    fn spawn_worker(&self, work_dir: &std::path::Path) -> Result<Child, ManagerError> {
        let stdout = std::fs::File::create(work_dir.join("worker_stdout.log"))
            .map_err(|e| ManagerError::Staging(e.to_string()))?;
        let stderr = std::fs::File::create(work_dir.join("worker_stderr.log"))
            .map_err(|e| ManagerError::Staging(e.to_string()))?;

        let child = Command::new(&self.config.worker_path)
            .arg(work_dir)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(ManagerError::Spawn)?;

        tracing::info!(
            pid = child.id(),
            worker = %self.config.worker_path.display(),
            "worker launched"
        );
        Ok(child)
    }

    /// Polls the status file until the worker reaches a terminal phase or
    /// the overall timeout elapses.
    async fn monitor(
        &self,
        work_dir: &std::path::Path,
        progress: Option<&ProgressFn>,
    ) -> Result<WorkerStatus, ManagerError> {
        let started = Instant::now();
        let mut last: Option<WorkerStatus> = None;

        loop {
            if started.elapsed() > self.config.timeout {
                return Err(ManagerError::Timeout(self.config.timeout));
            }

            // Absent or half-written status files just mean "check again".
            if let Ok(status) = protocol::load_status(work_dir) {
                if last.as_ref() != Some(&status) {
                    tracing::info!(
                        phase = ?status.phase,
                        progress = status.progress,
                        total = status.total,
                        message = %status.message,
                        "worker status"
                    );
                    if let Some(callback) = progress {
                        callback(status.progress, status.total, &status.message);
                    }
                    last = Some(status.clone());
                }

                if status.phase.is_terminal() {
                    return Ok(status);
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Waits for the worker to exit on its own, then terminates it.
    async fn reap(&self, child: &mut Child) {
        match tokio::time::timeout(self.config.exit_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(code = status.code(), "worker exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for worker");
            }
            Err(_) => {
                tracing::warn!(
                    grace = ?self.config.exit_grace,
                    "worker did not exit after terminal status, killing"
                );
                self.kill(child).await;
            }
        }
    }

    async fn kill(&self, child: &mut Child) {
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "failed to kill worker");
        }
    }

    /// Reads the worker's results listing and loads every successfully
    /// signed PDF. Unsuccessful entries and missing files are dropped with
    /// a log line; they surface later in the batch tally.
    fn read_results(&self, work_dir: &std::path::Path) -> Vec<SignedDocument> {
        let output = match protocol::load_output(work_dir) {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "worker output file missing or unreadable");
                return Vec::new();
            }
        };

        let mut signed = Vec::new();

        for result in &output.results {
            if !result.success {
                tracing::warn!(
                    document_id = result.document_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "document failed during signing"
                );
                continue;
            }

            let Some(signed_filename) = result.signed_filename.as_deref() else {
                tracing::error!(
                    document_id = result.document_id,
                    "successful result without a signed file name"
                );
                continue;
            };

            let signed_file = work_dir.join(signed_filename);
            let bytes = match std::fs::read(&signed_file) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(
                        document_id = result.document_id,
                        file = %signed_file.display(),
                        error = %e,
                        "signed PDF missing"
                    );
                    continue;
                }
            };

            signed.push(SignedDocument {
                document_id: result.document_id,
                remote_model: result.remote_model.clone(),
                remote_record_id: result.remote_record_id,
                signed_filename: upload_name(&result.original_filename),
                signed_pdf_bytes: bytes,
            });
        }

        signed
    }

    fn finish_work_dir(&self, work_dir: TempDir) {
        if self.config.keep_work_dir {
            let path = work_dir.keep();
            tracing::info!(dir = %path.display(), "working directory retained for diagnostics");
        }
        // Otherwise the TempDir drop removes it, whatever state the run
        // ended in.
    }
}

/// Derives the upload file name from the original: `report.pdf` becomes
/// `report_signed.pdf`.
fn upload_name(original: &str) -> String {
    match original.strip_suffix(".pdf") {
        Some(stem) => format!("{stem}_signed.pdf"),
        None => format!("{original}_signed.pdf"),
    }
}

#[async_trait]
impl DocumentSigning for SubprocessManager {
    async fn sign_documents(
        &self,
        documents: &[UnsignedDocument],
        credentials: &CredentialRecord,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<SignedDocument>, ManagerError> {
        tracing::info!(
            documents = documents.len(),
            hardware_token = credentials.use_hardware_token,
            "starting subprocess signing run"
        );

        let work_dir = self.prepare_work_dir(documents)?;

        let job = self.build_job(documents, credentials);
        protocol::store_job(work_dir.path(), &job)
            .map_err(|e| ManagerError::Staging(e.to_string()))?;

        let mut child = self.spawn_worker(work_dir.path())?;

        let final_status = match self.monitor(work_dir.path(), progress.as_ref()).await {
            Ok(status) => status,
            Err(timeout @ ManagerError::Timeout(_)) => {
                tracing::error!("worker timed out, terminating");
                self.kill(&mut child).await;
                let _ = child.wait().await;
                self.finish_work_dir(work_dir);
                return Err(timeout);
            }
            Err(other) => {
                self.kill(&mut child).await;
                self.finish_work_dir(work_dir);
                return Err(other);
            }
        };

        self.reap(&mut child).await;

        let outcome = match final_status.phase {
            WorkerPhase::Success => Ok(self.read_results(work_dir.path())),
            _ => Err(ManagerError::WorkerFailed(final_status.message)),
        };

        self.finish_work_dir(work_dir);
        outcome
    }
}
