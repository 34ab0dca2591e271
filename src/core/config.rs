use crate::core::error::{OrchestratorError, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub out_dir: PathBuf,
    /// Time between the graceful terminate signal and the forced kill.
    pub cancel_grace: Duration,
    pub event_capacity: usize,
}

impl OrchestratorConfig {
    pub fn new(out_dir: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            out_dir: out_dir.into(),
            cancel_grace: Duration::from_millis(3000),
            event_capacity: 1024,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(OrchestratorError::validation("max_concurrent must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(OrchestratorError::validation("event_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn staging_root(&self) -> PathBuf {
        self.out_dir.join(".partial")
    }
}
