//! File-based IPC contract between the signing agent and its worker
//! subprocess.
//!
//! One private working directory per signing run holds everything the two
//! processes exchange: a job descriptor, the staged unsigned PDFs, the
//! signed PDFs the worker produces, a status file the worker overwrites as
//! it makes progress, and a final results listing. The agent only ever
//! polls; the worker only ever writes.

mod files;
mod job;
mod output;
mod status;

pub use files::{
    INPUT_FILE, OUTPUT_FILE, STATUS_FILE, WORKER_LOG_FILE, input_path, load_job, load_output,
    load_status, output_path, signed_path, status_path, store_job, store_output, store_status,
    unsigned_path,
};
pub use job::{DocumentRef, SigningJobSpec};
pub use output::{DocumentResult, WorkerOutput};
pub use status::{WorkerPhase, WorkerStatus};

/// Errors raised while reading or writing protocol files.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
