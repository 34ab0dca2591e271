use crate::plugins::registry::{CliPlugin, EngineSettings};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct YtDlpCliPlugin;

impl YtDlpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for YtDlpCliPlugin {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn augment_serve_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("ytdlp_bin")
                .long("ytdlp-bin")
                .help_heading("YT-DLP")
                .help("Path to the yt-dlp binary")
                .default_value("yt-dlp")
                .num_args(1),
        )
        .arg(
            Arg::new("ytdlp_arg")
                .long("ytdlp-arg")
                .help_heading("YT-DLP")
                .help("Extra argument passed to every yt-dlp run (repeatable)")
                .action(ArgAction::Append)
                .allow_hyphen_values(true)
                .num_args(1),
        )
    }

    fn apply_serve_matches(&self, matches: &ArgMatches, settings: &mut EngineSettings) -> anyhow::Result<()> {
        if let Some(v) = matches.get_one::<String>("ytdlp_bin") {
            settings.options.insert("ytdlp_bin".to_string(), v.clone());
        }
        if let Some(vs) = matches.get_many::<String>("ytdlp_arg") {
            let joined = vs.map(|s| s.as_str()).collect::<Vec<_>>().join("\n");
            settings.options.insert("ytdlp_args".to_string(), joined);
        }
        Ok(())
    }
}
