use serde::{Deserialize, Serialize};

/// Worker lifecycle phase as reported through `status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Working,
    Success,
    Error,
}

impl WorkerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerPhase::Success | WorkerPhase::Error)
    }
}

/// Snapshot of worker progress. Overwritten in place, never appended, so
/// the monitoring side always sees the latest state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub message: String,
}

impl WorkerStatus {
    pub fn working(progress: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            phase: WorkerPhase::Working,
            progress,
            total,
            message: message.into(),
        }
    }

    pub fn success(total: u32, message: impl Into<String>) -> Self {
        Self {
            phase: WorkerPhase::Success,
            progress: total,
            total,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            phase: WorkerPhase::Error,
            progress: 0,
            total: 0,
            message: message.into(),
        }
    }
}
