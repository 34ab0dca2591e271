use crate::plugins::registry::{CliPlugin, EngineSettings};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct GalleryDlCliPlugin;

impl GalleryDlCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for GalleryDlCliPlugin {
    fn name(&self) -> &'static str {
        "gallery-dl"
    }

    fn augment_serve_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("gallery_dl_bin")
                .long("gallery-dl-bin")
                .help_heading("GALLERY-DL")
                .help("Path to the gallery-dl binary")
                .default_value("gallery-dl")
                .num_args(1),
        )
        .arg(
            Arg::new("gallery_dl_arg")
                .long("gallery-dl-arg")
                .help_heading("GALLERY-DL")
                .help("Extra argument passed to every gallery-dl run (repeatable)")
                .action(ArgAction::Append)
                .allow_hyphen_values(true)
                .num_args(1),
        )
    }

    fn apply_serve_matches(&self, matches: &ArgMatches, settings: &mut EngineSettings) -> anyhow::Result<()> {
        if let Some(v) = matches.get_one::<String>("gallery_dl_bin") {
            settings.options.insert("gallery_dl_bin".to_string(), v.clone());
        }
        if let Some(vs) = matches.get_many::<String>("gallery_dl_arg") {
            let joined = vs.map(|s| s.as_str()).collect::<Vec<_>>().join("\n");
            settings.options.insert("gallery_dl_args".to_string(), joined);
        }
        Ok(())
    }
}
