//! Engine double for tests: the request's `script` option runs through `sh`
//! from inside the staging directory.

use crate::core::model::{DownloadRequest, ProgressSnapshot};
use crate::plugins::registry::{DownloadEngine, EngineContext, EngineLine, OutputStream};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::process::Command;

pub struct ShEngine;

impl DownloadEngine for ShEngine {
    fn name(&self) -> &'static str {
        "sh"
    }

    fn can_handle(&self, _request: &DownloadRequest) -> u8 {
        100
    }

    fn build_command(&self, request: &DownloadRequest, ctx: &EngineContext) -> anyhow::Result<Command> {
        let script = request.option_str("script").context("missing script")?;
        let shell = request.option_str("shell").unwrap_or("sh");
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(script).current_dir(&ctx.staging_dir);
        Ok(cmd)
    }

    fn parse_line(&self, line: &str, _stream: OutputStream, now: DateTime<Utc>) -> EngineLine {
        if let Some(pct) = line.strip_prefix("PCT ") {
            return EngineLine::Progress(ProgressSnapshot { percent: pct.trim().parse().ok(), ..ProgressSnapshot::empty(now) });
        }
        if let Some(msg) = line.strip_prefix("ERROR: ") {
            return EngineLine::Error(msg.to_string());
        }
        EngineLine::Other
    }
}

pub fn sh_request(id: &str, script: &str) -> DownloadRequest {
    DownloadRequest::new(id, format!("https://media.test/{}", id)).with_option("script", serde_json::json!(script))
}

/// A script that blocks until [`open_gate`] is called for the same id.
pub fn gated_script(gates: &Path, id: &str) -> String {
    let gate = gates.join(id);
    format!(
        "echo 'PCT 10'; while [ ! -f '{}' ]; do sleep 0.05; done; echo 'PCT 100'",
        gate.display()
    )
}

pub fn open_gate(gates: &Path, id: &str) {
    std::fs::create_dir_all(gates).unwrap();
    std::fs::write(gates.join(id), b"go").unwrap();
}
