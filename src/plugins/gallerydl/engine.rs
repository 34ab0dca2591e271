use crate::core::model::DownloadRequest;
use crate::plugins::registry::{DownloadEngine, EngineContext, EngineLine, OutputStream};
use chrono::{DateTime, Utc};
use tokio::process::Command;
use url::Url;

const GALLERY_HOSTS: &[&str] = &[
    "pixiv.net",
    "twitter.com",
    "x.com",
    "instagram.com",
    "deviantart.com",
    "danbooru.donmai.us",
    "gelbooru.com",
    "imgur.com",
    "reddit.com",
    "tumblr.com",
    "artstation.com",
    "kemono.su",
    "flickr.com",
    "pinterest.com",
    "bsky.app",
];

pub struct GalleryDlEngine;

impl GalleryDlEngine {
    pub fn new() -> Self {
        Self
    }

    fn is_gallery_host(host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        GALLERY_HOSTS
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
    }
}

impl DownloadEngine for GalleryDlEngine {
    fn name(&self) -> &'static str {
        "gallery-dl"
    }

    fn can_handle(&self, request: &DownloadRequest) -> u8 {
        let Ok(u) = Url::parse(&request.url) else { return 0 };
        if u.scheme() != "http" && u.scheme() != "https" {
            return 0;
        }
        match u.host_str() {
            Some(h) if Self::is_gallery_host(h) => 80,
            _ => 20,
        }
    }

    fn build_command(&self, request: &DownloadRequest, ctx: &EngineContext) -> anyhow::Result<Command> {
        let bin = ctx.settings.option("gallery_dl_bin").unwrap_or("gallery-dl");

        let mut cmd = Command::new(bin);
        cmd.arg("-d").arg(&ctx.staging_dir);

        if let Some(range) = request.option_str("range") {
            cmd.arg("--range").arg(range);
        }
        for a in ctx.settings.list("gallery_dl_args") {
            cmd.arg(a);
        }

        cmd.arg("--").arg(&request.url);
        Ok(cmd)
    }

    /// gallery-dl prints one path per finished file on stdout (`# ` marks skipped
    /// files) and logs to stderr as `[category][level] message`.
    fn parse_line(&self, line: &str, stream: OutputStream, _now: DateTime<Utc>) -> EngineLine {
        let line = line.trim();
        if line.is_empty() {
            return EngineLine::Other;
        }
        if let Some(idx) = line.find("][error]") {
            return EngineLine::Error(line[idx + "][error]".len()..].trim().to_string());
        }
        if let Some(msg) = line.strip_prefix("[error]") {
            return EngineLine::Error(msg.trim().to_string());
        }
        match stream {
            OutputStream::Stdout if !line.starts_with('#') && !line.starts_with('[') => EngineLine::FileDone,
            _ => EngineLine::Other,
        }
    }
}
