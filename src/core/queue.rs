use crate::core::error::{OrchestratorError, Result};
use crate::core::model::{DownloadRequest, QueueEntry};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};

/// Pending requests waiting for a slot, in admission order.
#[derive(Debug, Default)]
pub struct DownloadQueue {
    entries: VecDeque<QueueEntry>,
}

impl DownloadQueue {
    /// Appends at the tail and returns the 1-based position.
    pub fn enqueue(&mut self, request: DownloadRequest) -> usize {
        self.entries.push_back(QueueEntry { request, enqueued_at: Utc::now() });
        self.entries.len()
    }

    /// Replaces the order atomically. `order` must name every queued id exactly once.
    pub fn reorder(&mut self, order: &[String]) -> Result<()> {
        if order.len() != self.entries.len() {
            return Err(OrchestratorError::validation(format!(
                "reorder must list all {} queued ids, got {}",
                self.entries.len(),
                order.len()
            )));
        }

        let mut seen = HashSet::with_capacity(order.len());
        for id in order {
            if !seen.insert(id.as_str()) {
                return Err(OrchestratorError::validation(format!("duplicate id in reorder: {}", id)));
            }
            if !self.contains(id) {
                return Err(OrchestratorError::validation(format!("id not in queue: {}", id)));
            }
        }

        let mut old: Vec<Option<QueueEntry>> = self.entries.drain(..).map(Some).collect();
        for id in order {
            let slot = old
                .iter_mut()
                .find(|e| e.as_ref().map(|e| &e.request.id == id).unwrap_or(false));
            if let Some(entry) = slot.and_then(Option::take) {
                self.entries.push_back(entry);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<QueueEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.request.id == id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("download {} is not queued", id)))?;
        self.entries.remove(idx).ok_or_else(|| OrchestratorError::not_found(id))
    }

    pub fn dequeue_head(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.request.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.request.id == id)
    }

    pub fn list(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
