use std::sync::Arc;

use crate::credentials::{CredentialBroker, CredentialRecord};
use crate::error::AgentError;
use crate::manager::{DocumentSigning, ProgressFn};
use crate::remote::{BatchState, RemoteBackendFactory, RemoteError};
use crate::server::SigningRequest;

/// Final accounting for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failed_count: usize,
    pub per_document_errors: Vec<(i64, String)>,
}

/// Top-level coordinator for one signing request: credentials, remote
/// session, subprocess signing, upload, finalization.
pub struct Orchestrator {
    broker: Arc<CredentialBroker>,
    signing: Arc<dyn DocumentSigning>,
    backends: Arc<dyn RemoteBackendFactory>,
}

impl Orchestrator {
    pub fn new(
        broker: Arc<CredentialBroker>,
        signing: Arc<dyn DocumentSigning>,
        backends: Arc<dyn RemoteBackendFactory>,
    ) -> Self {
        Self {
            broker,
            signing,
            backends,
        }
    }

    /// Runs a batch to completion and logs the outcome. Used as the
    /// background task body: nothing may unwind out of here into the
    /// listener.
    pub async fn run_and_report(&self, request: SigningRequest, credentials: CredentialRecord) {
        let batch_id = request.batch;
        match self.run(&request, &credentials).await {
            Ok(outcome) => {
                tracing::info!(
                    batch_id,
                    signed = outcome.success_count,
                    failed = outcome.failed_count,
                    "batch run finished"
                );
            }
            Err(e) => {
                tracing::error!(batch_id, error = %e, "batch run aborted");
            }
        }
    }

    /// Executes the batch pipeline. Steps run strictly in order; each
    /// failure point carries its own recovery policy.
    pub async fn run(
        &self,
        request: &SigningRequest,
        credentials: &CredentialRecord,
    ) -> Result<BatchOutcome, AgentError> {
        let mut backend = self.backends.connect(request, credentials);

        // Authentication failure means the cached record is presumed stale:
        // purge it so the next attempt re-prompts.
        if let Err(e) = backend.authenticate().await {
            if matches!(e, RemoteError::Authentication(_)) {
                self.broker.clear(&request.url);
            }
            return Err(e.into());
        }

        // A rejected token aborts without mutating remote state; the
        // request may simply be stale.
        backend.validate_batch_token(request.batch).await?;

        let documents = backend.download_unsigned(request.batch).await?;
        if documents.is_empty() {
            return Err(AgentError::EmptyBatch(request.batch));
        }

        let total = documents.len();
        let progress: ProgressFn = {
            let batch_id = request.batch;
            Arc::new(move |done, total, message| {
                tracing::info!(batch_id, done, total, message, "signing progress");
            })
        };

        let signed = self
            .signing
            .sign_documents(&documents, credentials, Some(progress))
            .await;

        // A run-level signing failure (worker error, timeout) fails the
        // whole batch; the remote side is told so the operator can relaunch.
        let signed = match signed {
            Ok(signed) => signed,
            Err(e) => {
                if let Err(fin) = backend.finalize_batch(request.batch, BatchState::Error).await {
                    tracing::error!(batch_id = request.batch, error = %fin, "failed to finalize batch after signing failure");
                }
                return Err(e.into());
            }
        };

        let mut outcome = BatchOutcome::default();

        for document in &signed {
            match backend.upload_signed(document).await {
                Ok(()) => {
                    outcome.success_count += 1;
                }
                Err(e) => {
                    // Partial upload failure is expected and counted, never
                    // fatal to the rest of the batch.
                    tracing::error!(
                        document_id = document.document_id,
                        error = %e,
                        "upload failed"
                    );
                    outcome
                        .per_document_errors
                        .push((document.document_id, e.to_string()));
                }
            }
        }

        // Documents that never came back signed count as failures too.
        for document in &documents {
            let was_signed = signed.iter().any(|s| s.document_id == document.document_id);
            if !was_signed {
                outcome
                    .per_document_errors
                    .push((document.document_id, "signing failed".into()));
            }
        }
        outcome.failed_count = total - outcome.success_count;

        let state = if outcome.failed_count == 0 {
            BatchState::Done
        } else {
            BatchState::Error
        };
        backend.finalize_batch(request.batch, state).await?;

        Ok(outcome)
    }
}
