/// Decides whether a request may take a concurrency slot right now.
///
/// The controller keeps no counters of its own: callers pass in the number of
/// slot-holding records (downloading + paused) they observed under the registry
/// lock, so the decision and the mutation it guards happen atomically.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Queued,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent: max_concurrent.max(1) }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn has_capacity(&self, active: usize) -> bool {
        active < self.max_concurrent
    }

    pub fn try_admit(&self, active: usize) -> Admission {
        if self.has_capacity(active) {
            Admission::Admitted
        } else {
            Admission::Queued
        }
    }

    /// Called after a record leaves the slot-holding states. Returns whether
    /// the queue should be drained.
    pub fn on_slot_freed(&self, active: usize, queued: usize) -> bool {
        queued > 0 && self.has_capacity(active)
    }
}
