use std::fs;
use std::path::{Path, PathBuf};

use crate::{ProtocolError, SigningJobSpec, WorkerOutput, WorkerStatus};

pub const INPUT_FILE: &str = "input.json";
pub const STATUS_FILE: &str = "status.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const WORKER_LOG_FILE: &str = "worker.log";

pub fn input_path(work_dir: &Path) -> PathBuf {
    work_dir.join(INPUT_FILE)
}

pub fn status_path(work_dir: &Path) -> PathBuf {
    work_dir.join(STATUS_FILE)
}

pub fn output_path(work_dir: &Path) -> PathBuf {
    work_dir.join(OUTPUT_FILE)
}

pub fn unsigned_path(work_dir: &Path, document_id: i64) -> PathBuf {
    work_dir.join(format!("unsigned_{document_id}.pdf"))
}

pub fn signed_path(work_dir: &Path, document_id: i64) -> PathBuf {
    work_dir.join(format!("signed_{document_id}.pdf"))
}

pub fn store_job(work_dir: &Path, job: &SigningJobSpec) -> Result<(), ProtocolError> {
    write_json(&input_path(work_dir), job)
}

pub fn load_job(work_dir: &Path) -> Result<SigningJobSpec, ProtocolError> {
    read_json(&input_path(work_dir))
}

/// Overwrites the status file atomically (write-then-rename) so a reader
/// polling at the same moment never observes a half-written document.
pub fn store_status(work_dir: &Path, status: &WorkerStatus) -> Result<(), ProtocolError> {
    write_json(&status_path(work_dir), status)
}

pub fn load_status(work_dir: &Path) -> Result<WorkerStatus, ProtocolError> {
    read_json(&status_path(work_dir))
}

pub fn store_output(work_dir: &Path, output: &WorkerOutput) -> Result<(), ProtocolError> {
    write_json(&output_path(work_dir), output)
}

pub fn load_output(work_dir: &Path) -> Result<WorkerOutput, ProtocolError> {
    read_json(&output_path(work_dir))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProtocolError> {
    let payload = fs::read(path)?;
    Ok(serde_json::from_slice(&payload)?)
}
