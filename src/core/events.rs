use crate::core::model::{DownloadId, DownloadStatus, ProcessOutcome, ProgressSnapshot, RunId};

/// Emitted by running engine processes, consumed by the orchestrator's event pump.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Progress { id: DownloadId, run: RunId, snapshot: ProgressSnapshot },
    Exited { id: DownloadId, run: RunId, outcome: ProcessOutcome },
}

/// Broadcast to observers of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    Queued { id: DownloadId, position: usize },
    StatusChanged { id: DownloadId, status: DownloadStatus },
    Cleared { ids: Vec<DownloadId> },
}
