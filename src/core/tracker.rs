use crate::core::error::{OrchestratorError, Result};
use crate::core::model::{
    DownloadId, DownloadRecord, DownloadStatus, ErrorCategory, ErrorDetail, ProgressSnapshot, RunId, SpeedSample,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Live download records keyed by id. Lives inside the registry lock.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    records: HashMap<DownloadId, DownloadRecord>,
}

/// Predicate for bulk clearing. Fields combine with AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearFilter {
    pub status: Option<DownloadStatus>,
    pub min_age_secs: Option<i64>,
}

impl ClearFilter {
    pub const WILDCARD: &'static str = "all";

    /// Builds a filter from the raw query values. Neither value given is rejected;
    /// clearing everything needs `status=all`.
    pub fn parse(status: Option<&str>, age_secs: Option<i64>) -> Result<Self> {
        let status = match status.map(str::trim).filter(|s| !s.is_empty()) {
            None => {
                if age_secs.is_none() {
                    return Err(OrchestratorError::validation(
                        "bulk clear needs a status or age filter (use status=all to clear everything)",
                    ));
                }
                None
            }
            Some(s) if s.eq_ignore_ascii_case(Self::WILDCARD) || s == "*" => None,
            Some(s) => match DownloadStatus::parse(s) {
                Some(DownloadStatus::Queued) => {
                    return Err(OrchestratorError::validation(
                        "queued entries are removed through the queue, not bulk clear",
                    ))
                }
                Some(st) => Some(st),
                None => return Err(OrchestratorError::validation(format!("unknown status filter: {}", s))),
            },
        };

        if let Some(age) = age_secs {
            if age < 0 {
                return Err(OrchestratorError::validation("age must not be negative"));
            }
        }

        Ok(Self { status, min_age_secs: age_secs })
    }

    pub fn matches(&self, record: &DownloadRecord, now: DateTime<Utc>) -> bool {
        let status_ok = self.status.map(|s| s == record.status).unwrap_or(true);
        let age_ok = self.min_age_secs.map(|a| record.age_secs(now) >= a).unwrap_or(true);
        status_ok && age_ok
    }
}

impl ProgressTracker {
    pub fn insert(&mut self, record: DownloadRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<&DownloadRecord> {
        self.records.get(id).ok_or_else(|| OrchestratorError::not_found(id))
    }

    pub fn status(&self, id: &str) -> Option<DownloadStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// True when the record for `id` belongs to `run`. Events from an earlier run of
    /// a cleared and resubmitted id fail this check.
    pub fn is_run(&self, id: &str, run: RunId) -> bool {
        self.records.get(id).map(|r| r.run == run).unwrap_or(false)
    }

    pub fn is_live_run(&self, id: &str, run: RunId) -> bool {
        self.records
            .get(id)
            .map(|r| r.run == run && r.status.occupies_slot())
            .unwrap_or(false)
    }

    pub fn list_all(&self) -> impl Iterator<Item = &DownloadRecord> {
        self.records.values()
    }

    pub fn count_with(&self, status: DownloadStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    pub fn slots_in_use(&self) -> usize {
        self.records.values().filter(|r| r.status.occupies_slot()).count()
    }

    /// Appends to history and speed samples and replaces the current snapshot.
    /// Updates for terminal records are dropped.
    pub fn update(&mut self, id: &str, snapshot: ProgressSnapshot) -> Result<()> {
        let record = self.records.get_mut(id).ok_or_else(|| OrchestratorError::not_found(id))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        record.speed_samples.push(SpeedSample { timestamp: snapshot.timestamp, speed: snapshot.speed });
        record.history.push(snapshot.clone());
        record.updated_at = snapshot.timestamp;
        record.progress = snapshot;
        Ok(())
    }

    /// Moves a live record from `from` to `to`. Anything else is `NotFound`:
    /// there is no process in the expected state to act on.
    pub fn transition(&mut self, id: &str, from: DownloadStatus, to: DownloadStatus) -> Result<()> {
        match self.records.get_mut(id) {
            Some(r) if r.status == from => {
                r.status = to;
                r.updated_at = Utc::now();
                Ok(())
            }
            Some(r) => Err(OrchestratorError::NotFound(format!("download {} is {}, not {}", id, r.status, from))),
            None => Err(OrchestratorError::not_found(id)),
        }
    }

    /// Sets a terminal status. Returns `false` when the record was already terminal
    /// (the first terminal status wins).
    pub fn mark_terminal(&mut self, id: &str, status: DownloadStatus, error: Option<ErrorDetail>) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let record = self.records.get_mut(id).ok_or_else(|| OrchestratorError::not_found(id))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = status;
        record.updated_at = Utc::now();
        if status == DownloadStatus::Failed {
            record.error_detail = Some(error.unwrap_or_else(|| ErrorDetail {
                original_message: "download failed".to_string(),
                parsed_type: ErrorCategory::HookError,
                source: record.engine.clone(),
            }));
        }
        if status == DownloadStatus::Completed {
            if let Some(total) = record.progress.total {
                record.progress.downloaded = Some(total);
            }
            record.progress.percent = Some(100.0);
            record.progress.eta = Some(0);
        }
        Ok(true)
    }

    pub fn set_control_error(&mut self, id: &str, detail: ErrorDetail) {
        if let Some(r) = self.records.get_mut(id) {
            r.last_control_error = Some(detail);
        }
    }

    pub fn set_priority(&mut self, id: &str, nice: i32) {
        if let Some(r) = self.records.get_mut(id) {
            r.priority = Some(nice);
            r.last_control_error = None;
        }
    }

    pub fn clear_one(&mut self, id: &str) -> Result<DownloadRecord> {
        self.records.remove(id).ok_or_else(|| OrchestratorError::not_found(id))
    }

    pub fn clear_bulk(&mut self, filter: &ClearFilter, now: DateTime<Utc>) -> Vec<DownloadRecord> {
        let ids: Vec<DownloadId> = self
            .records
            .values()
            .filter(|r| filter.matches(r, now))
            .map(|r| r.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.records.remove(id)).collect()
    }
}

/// Maps raw engine error text onto the failure taxonomy. Unmatched text falls back
/// to `HookError`.
pub fn classify_error(raw: &str) -> ErrorCategory {
    let msg = raw.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["unsupported url", "no suitable extractor", "unsupported site"]) {
        ErrorCategory::UnsupportedUrl
    } else if has(&["drm protect", "drm-protect", "drm encrypt", "widevine"]) {
        ErrorCategory::DrmProtected
    } else if has(&["private video", "this video is private", "private account"]) {
        ErrorCategory::PrivateVideo
    } else if has(&["not available in your country", "geo restrict", "geo-restrict", "geoblock", "your location"]) {
        ErrorCategory::GeoRestricted
    } else if has(&["no video formats", "requested format is not available", "no formats found"]) {
        ErrorCategory::NoFormats
    } else if has(&["sign in to confirm", "login required", "requires authentication", "members-only"]) {
        ErrorCategory::LoginRequired
    } else if has(&["http error 429", "too many requests", "rate limit"]) {
        ErrorCategory::RateLimited
    } else if has(&["video unavailable", "not available", "has been removed", "does not exist", "http error 404"]) {
        ErrorCategory::VideoUnavailable
    } else {
        ErrorCategory::HookError
    }
}

pub fn engine_failure(raw: &str, source: &str) -> ErrorDetail {
    ErrorDetail {
        original_message: raw.trim().to_string(),
        parsed_type: classify_error(raw),
        source: source.to_string(),
    }
}
