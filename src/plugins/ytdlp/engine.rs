use crate::core::model::{DownloadRequest, ProgressSnapshot};
use crate::plugins::registry::{DownloadEngine, EngineContext, EngineLine, OutputStream};
use chrono::{DateTime, Utc};
use tokio::process::Command;
use url::Url;

const PROGRESS_TAG: &str = "[vgrab]";

pub struct YtDlpEngine;

impl YtDlpEngine {
    pub fn new() -> Self {
        Self
    }

    fn progress_template() -> String {
        format!(
            "download:{} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s",
            PROGRESS_TAG
        )
    }

    fn field<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
        match raw {
            None | Some("NA") | Some("None") => None,
            Some(s) => s.parse().ok(),
        }
    }

    fn parse_progress(rest: &str, now: DateTime<Utc>) -> Option<ProgressSnapshot> {
        let mut parts = rest.split_whitespace();
        let downloaded: Option<u64> = Self::field::<f64>(parts.next()).map(|v| v as u64);
        let total: Option<u64> = Self::field::<f64>(parts.next()).map(|v| v as u64);
        let estimate: Option<u64> = Self::field::<f64>(parts.next()).map(|v| v as u64);
        let speed: Option<f64> = Self::field(parts.next());
        let eta: Option<u64> = Self::field::<f64>(parts.next()).map(|v| v as u64);

        let total = total.or(estimate);
        let percent = match (downloaded, total) {
            (Some(d), Some(t)) if t > 0 => Some(((d as f64 / t as f64) * 100.0).min(100.0)),
            _ => None,
        };

        if downloaded.is_none() && percent.is_none() {
            return None;
        }

        Some(ProgressSnapshot { percent, downloaded, total, speed, eta, timestamp: now })
    }
}

impl DownloadEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn can_handle(&self, request: &DownloadRequest) -> u8 {
        if let Ok(u) = Url::parse(&request.url) {
            if u.scheme() == "http" || u.scheme() == "https" {
                return 50;
            }
        }
        0
    }

    fn build_command(&self, request: &DownloadRequest, ctx: &EngineContext) -> anyhow::Result<Command> {
        let bin = ctx.settings.option("ytdlp_bin").unwrap_or("yt-dlp");

        let mut cmd = Command::new(bin);
        cmd.arg("--newline")
            .arg("--no-colors")
            .arg("--progress-template")
            .arg(Self::progress_template())
            .arg("-P")
            .arg(&ctx.staging_dir);

        if let Some(format) = request.option_str("format") {
            cmd.arg("-f").arg(format);
        }
        if request.engine_options.get("audioOnly").and_then(|v| v.as_bool()).unwrap_or(false) {
            cmd.arg("-x");
        }
        match request.is_playlist {
            Some(true) => {
                cmd.arg("--yes-playlist");
            }
            Some(false) => {
                cmd.arg("--no-playlist");
            }
            None => {}
        }
        for a in ctx.settings.list("ytdlp_args") {
            cmd.arg(a);
        }

        cmd.arg("--").arg(&request.url);
        Ok(cmd)
    }

    fn parse_line(&self, line: &str, _stream: OutputStream, now: DateTime<Utc>) -> EngineLine {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(PROGRESS_TAG) {
            return Self::parse_progress(rest, now).map(EngineLine::Progress).unwrap_or(EngineLine::Other);
        }
        if let Some(msg) = line.strip_prefix("ERROR:") {
            return EngineLine::Error(msg.trim().to_string());
        }
        EngineLine::Other
    }
}
