use crate::core::error::{OrchestratorError, Result};
use crate::core::model::{DownloadRequest, ProgressSnapshot};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgMatches, Command};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Engine settings collected from the command line (binary paths, extra args).
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub options: HashMap<String, String>,
}

impl EngineSettings {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    /// Repeatable args are stored newline-joined under one key.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.options
            .get(key)
            .map(|s| s.lines().filter(|l| !l.is_empty()).map(|l| l.to_string()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct EngineContext {
    pub staging_dir: PathBuf,
    pub settings: EngineSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One interpreted line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineLine {
    Progress(ProgressSnapshot),
    /// A whole file finished; for engines that only report per-file completion.
    FileDone,
    Error(String),
    Other,
}

pub trait DownloadEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, request: &DownloadRequest) -> u8;
    fn build_command(&self, request: &DownloadRequest, ctx: &EngineContext) -> anyhow::Result<tokio::process::Command>;
    fn parse_line(&self, line: &str, stream: OutputStream, now: DateTime<Utc>) -> EngineLine;
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_serve_command(&self, cmd: Command) -> Command;
    fn apply_serve_matches(&self, matches: &ArgMatches, settings: &mut EngineSettings) -> anyhow::Result<()>;
}

pub struct EngineRegistry {
    engines: Vec<Arc<dyn DownloadEngine>>,
    cli_plugins: Vec<Box<dyn CliPlugin>>,
    settings: EngineSettings,
}

impl EngineRegistry {
    pub fn empty() -> Self {
        Self { engines: vec![], cli_plugins: vec![], settings: EngineSettings::default() }
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::empty();

        reg.engines.push(Arc::new(crate::plugins::ytdlp::engine::YtDlpEngine::new()));
        reg.engines.push(Arc::new(crate::plugins::gallerydl::engine::GalleryDlEngine::new()));

        reg.cli_plugins.push(Box::new(crate::plugins::ytdlp::cli::YtDlpCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::gallerydl::cli::GalleryDlCliPlugin::new()));
        reg
    }

    #[cfg(test)]
    pub fn with_engine(mut self, engine: Arc<dyn DownloadEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn augment_serve_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_serve_command(c))
    }

    pub fn apply_serve_matches(&mut self, matches: &ArgMatches) -> anyhow::Result<()> {
        let mut settings = std::mem::take(&mut self.settings);
        for p in &self.cli_plugins {
            p.apply_serve_matches(matches, &mut settings)
                .with_context(|| format!("{} options", p.name()))?;
        }
        self.settings = settings;
        Ok(())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn engine_names(&self) -> Vec<&'static str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    /// Honors an explicit `engine` option, otherwise picks the highest-scoring engine.
    pub fn select(&self, request: &DownloadRequest) -> Result<Arc<dyn DownloadEngine>> {
        if let Some(wanted) = request.option_str("engine") {
            return self
                .engines
                .iter()
                .find(|e| e.name().eq_ignore_ascii_case(wanted))
                .cloned()
                .ok_or_else(|| OrchestratorError::validation(format!("unknown engine: {}", wanted)));
        }

        self.engines
            .iter()
            .map(|e| (e.can_handle(request), e))
            .max_by_key(|(score, _)| *score)
            .and_then(|(score, e)| if score == 0 { None } else { Some(e.clone()) })
            .ok_or_else(|| OrchestratorError::validation(format!("no engine can handle {}", request.url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_gallery_engine_for_gallery_hosts() {
        let reg = EngineRegistry::with_defaults();
        let gallery = DownloadRequest::new("a", "https://www.pixiv.net/en/artworks/123");
        let video = DownloadRequest::new("b", "https://www.youtube.com/watch?v=abc");

        assert_eq!(reg.select(&gallery).unwrap().name(), "gallery-dl");
        assert_eq!(reg.select(&video).unwrap().name(), "yt-dlp");
    }

    #[test]
    fn explicit_engine_option_wins() {
        let reg = EngineRegistry::with_defaults();
        let req = DownloadRequest::new("a", "https://www.pixiv.net/en/artworks/123")
            .with_option("engine", serde_json::json!("yt-dlp"));
        assert_eq!(reg.select(&req).unwrap().name(), "yt-dlp");

        let bad = DownloadRequest::new("b", "https://x.test/v").with_option("engine", serde_json::json!("wget"));
        assert!(matches!(reg.select(&bad), Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn empty_registry_rejects_everything() {
        let reg = EngineRegistry::empty();
        assert!(reg.select(&DownloadRequest::new("a", "https://x.test/v")).is_err());
    }

    struct Strict;

    impl CliPlugin for Strict {
        fn name(&self) -> &'static str {
            "strict"
        }

        fn augment_serve_command(&self, cmd: Command) -> Command {
            cmd
        }

        fn apply_serve_matches(&self, _matches: &ArgMatches, _settings: &mut EngineSettings) -> anyhow::Result<()> {
            anyhow::bail!("rejected")
        }
    }

    #[test]
    fn plugin_option_errors_name_the_plugin() {
        let mut reg = EngineRegistry::empty();
        reg.cli_plugins.push(Box::new(Strict));
        let matches = reg.augment_serve_command(Command::new("serve")).get_matches_from(["serve"]);

        let err = reg.apply_serve_matches(&matches).unwrap_err();
        assert_eq!(format!("{:#}", err), "strict options: rejected");
    }

    #[test]
    fn settings_split_repeatable_lists() {
        let mut s = EngineSettings::default();
        s.options.insert("ytdlp_args".to_string(), "--no-mtime\n--embed-subs".to_string());
        assert_eq!(s.list("ytdlp_args"), vec!["--no-mtime".to_string(), "--embed-subs".to_string()]);
        assert!(s.list("missing").is_empty());
    }
}
