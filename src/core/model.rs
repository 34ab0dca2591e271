use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type DownloadId = String;

/// Identifies one launch of a download. A cleared id can be submitted again, so
/// process handles and engine events are matched on the run, not the id.
pub type RunId = Uuid;

/// Opaque per-request options. Engines pick out the keys they understand.
pub type EngineOptions = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: DownloadId,
    pub url: String,
    pub title: Option<String>,
    pub engine_options: EngineOptions,
    pub is_playlist: Option<bool>,
}

impl DownloadRequest {
    pub fn new(id: impl Into<DownloadId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            title: None,
            engine_options: EngineOptions::new(),
            is_playlist: None,
        }
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.engine_options.insert(key.to_string(), value);
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.engine_options.get(key).and_then(|v| v.as_str())
    }

    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| self.url.clone())
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub request: DownloadRequest,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Downloading and paused records both hold a concurrency slot.
    pub fn occupies_slot(self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "downloading" => Some(Self::Downloading),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub percent: Option<f64>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self { percent: None, downloaded: None, total: None, speed: None, eta: None, timestamp }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedSample {
    pub timestamp: DateTime<Utc>,
    pub speed: Option<f64>,
}

/// Failure categories derived from raw engine error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    UnsupportedUrl,
    NoFormats,
    VideoUnavailable,
    PrivateVideo,
    GeoRestricted,
    DrmProtected,
    LoginRequired,
    RateLimited,
    HookError,
    ServerError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedUrl => "UNSUPPORTED_URL",
            Self::NoFormats => "NO_FORMATS",
            Self::VideoUnavailable => "VIDEO_UNAVAILABLE",
            Self::PrivateVideo => "PRIVATE_VIDEO",
            Self::GeoRestricted => "GEO_RESTRICTED",
            Self::DrmProtected => "DRM_PROTECTED",
            Self::LoginRequired => "LOGIN_REQUIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::HookError => "HOOK_ERROR",
            Self::ServerError => "SERVER_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub original_message: String,
    pub parsed_type: ErrorCategory,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub run: RunId,
    pub url: String,
    pub title: String,
    pub engine: String,
    pub status: DownloadStatus,
    pub progress: ProgressSnapshot,
    pub history: Vec<ProgressSnapshot>,
    pub speed_samples: Vec<SpeedSample>,
    pub error_detail: Option<ErrorDetail>,
    pub last_control_error: Option<ErrorDetail>,
    pub priority: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn admitted(request: &DownloadRequest, engine: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id.clone(),
            run: Uuid::new_v4(),
            url: request.url.clone(),
            title: request.display_title(),
            engine: engine.to_string(),
            status: DownloadStatus::Downloading,
            progress: ProgressSnapshot::empty(now),
            history: Vec::new(),
            speed_samples: Vec::new(),
            error_detail: None,
            last_control_error: None,
            priority: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

/// Outcome reported when an engine process exits.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed,
    Failed(ErrorDetail),
    Canceled,
}

/// Status reply shape shared by the per-id and all-ids status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub status: DownloadStatus,
    pub url: String,
    pub title: String,
    pub percent: Option<f64>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub history: Vec<ProgressSnapshot>,
    pub speeds: Vec<SpeedSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(rename = "lastControlError", skip_serializing_if = "Option::is_none")]
    pub last_control_error: Option<ErrorDetail>,
}

impl StatusView {
    pub fn from_record(r: &DownloadRecord) -> Self {
        Self {
            status: r.status,
            url: r.url.clone(),
            title: r.title.clone(),
            percent: r.progress.percent,
            downloaded: r.progress.downloaded,
            total: r.progress.total,
            speed: r.progress.speed,
            eta: r.progress.eta,
            history: r.history.clone(),
            speeds: r.speed_samples.clone(),
            priority: r.priority,
            error_type: r.error_detail.as_ref().map(|e| e.parsed_type),
            message: r.error_detail.as_ref().map(|e| e.original_message.clone()),
            error: r.error_detail.clone(),
            last_control_error: r.last_control_error.clone(),
        }
    }

    pub fn from_queued(entry: &QueueEntry) -> Self {
        Self {
            status: DownloadStatus::Queued,
            url: entry.request.url.clone(),
            title: entry.request.display_title(),
            percent: Some(0.0),
            downloaded: None,
            total: None,
            speed: None,
            eta: None,
            history: Vec::new(),
            speeds: Vec::new(),
            priority: None,
            error_type: None,
            message: None,
            error: None,
            last_control_error: None,
        }
    }
}
