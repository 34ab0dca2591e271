mod core;
mod logging;
mod plugins;
mod server;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use crate::core::config::OrchestratorConfig;
use crate::core::discovery::{discover, DiscoveryOptions, HttpLivenessCheck, PortCache};
use crate::core::orchestrator::DownloadOrchestrator;
use crate::core::store::HistoryStore;
use crate::plugins::registry::EngineRegistry;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

fn build_cli(registry: &EngineRegistry) -> Command {
    let serve = Command::new("serve")
        .about("Run the local download server")
        .arg(
            Arg::new("host")
                .long("host")
                .help("Address to bind")
                .default_value("127.0.0.1")
                .num_args(1),
        )
        .arg(
            Arg::new("port_start")
                .long("port-start")
                .help("First port to try")
                .default_value("9090")
                .value_parser(clap::value_parser!(u16))
                .num_args(1),
        )
        .arg(
            Arg::new("port_end")
                .long("port-end")
                .help("Last port to try")
                .default_value("9100")
                .value_parser(clap::value_parser!(u16))
                .num_args(1),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory")
                .default_value("./downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("max_concurrent")
                .long("max-concurrent")
                .help("Max downloads running at once")
                .default_value("3")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("cancel_grace_ms")
                .long("cancel-grace-ms")
                .help("Wait between terminate and kill on cancel")
                .default_value("3000")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .help("History database (default: <out-dir>/.vidgrab.sqlite)")
                .num_args(1),
        )
        .arg(
            Arg::new("log_dir")
                .long("log-dir")
                .help("Write logs to a daily rolling file in this directory")
                .num_args(1),
        );

    let serve = registry.augment_serve_command(serve);

    let discover = Command::new("discover")
        .about("Find a running server by probing a port range")
        .arg(
            Arg::new("host")
                .long("host")
                .default_value("127.0.0.1")
                .num_args(1),
        )
        .arg(
            Arg::new("port_start")
                .long("port-start")
                .default_value("9090")
                .value_parser(clap::value_parser!(u16))
                .num_args(1),
        )
        .arg(
            Arg::new("port_end")
                .long("port-end")
                .default_value("9100")
                .value_parser(clap::value_parser!(u16))
                .num_args(1),
        )
        .arg(
            Arg::new("timeout_ms")
                .long("timeout-ms")
                .help("Overall time budget for the search")
                .default_value("3000")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("batch_size")
                .long("batch-size")
                .help("Ports probed concurrently per batch")
                .default_value("5")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("force_scan")
                .long("force-scan")
                .help("Ignore the cached port")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache_file")
                .long("cache-file")
                .help("Where the last good port is remembered")
                .num_args(1),
        );

    Command::new("vidgrab")
        .about("Local yt-dlp / gallery-dl download server")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(serve)
        .subcommand(discover)
}

fn required<T: Clone + Send + Sync + 'static>(m: &ArgMatches, id: &str) -> anyhow::Result<T> {
    m.get_one::<T>(id).cloned().with_context(|| format!("missing --{}", id.replace('_', "-")))
}

async fn run_serve(mut registry: EngineRegistry, m: &ArgMatches) -> anyhow::Result<()> {
    let _guard = logging::init(m.get_one::<String>("log_dir").map(PathBuf::from).as_deref())?;

    registry.apply_serve_matches(m)?;

    let host: String = required(m, "host")?;
    let port_start: u16 = required(m, "port_start")?;
    let port_end: u16 = required(m, "port_end")?;
    let out_dir = PathBuf::from(required::<String>(m, "out_dir")?);
    let max_concurrent: usize = required(m, "max_concurrent")?;
    let grace_ms: u64 = required(m, "cancel_grace_ms")?;

    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("create out_dir {}", out_dir.display()))?;

    let db = m
        .get_one::<String>("db")
        .map(PathBuf::from)
        .unwrap_or_else(|| out_dir.join(".vidgrab.sqlite"));
    let history = match HistoryStore::open(&db).await {
        Ok(store) => Some(store),
        Err(e) => {
            let msg = format!("{:#}", e);
            warn!(db = %db.display(), error = %msg, "history disabled");
            None
        }
    };

    info!(engines = ?registry.engine_names(), "engines loaded");
    let cfg = OrchestratorConfig::new(out_dir, max_concurrent).with_cancel_grace(Duration::from_millis(grace_ms));
    let orchestrator = DownloadOrchestrator::new(cfg, registry, history)?;

    let listener = server::bind_first_available(&host, port_start, port_end).await?;
    server::serve(listener, server::AppState::new(orchestrator), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
}

async fn run_discover(m: &ArgMatches) -> anyhow::Result<()> {
    let host: String = required(m, "host")?;
    let timeout = Duration::from_millis(required(m, "timeout_ms")?);
    let opts = DiscoveryOptions {
        range_start: required(m, "port_start")?,
        range_end: required(m, "port_end")?,
        force_scan: m.get_flag("force_scan"),
        timeout,
        batch_size: required(m, "batch_size")?,
    };
    anyhow::ensure!(opts.range_start <= opts.range_end, "--port-start must not exceed --port-end");

    let cache = match m.get_one::<String>("cache_file") {
        Some(path) => PortCache::load(path),
        None => PortCache::in_memory(None),
    };
    let check = HttpLivenessCheck::new(host, server::APP_NAME, timeout)?;

    let total = (opts.range_end - opts.range_start) as u64 + 1;
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} probing {bar:30.cyan/blue} {pos}/{len} ports")?
            .tick_chars("|/-\\ "),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    let progress_bar = pb.clone();
    let on_progress = move |scanned: usize| progress_bar.set_position(scanned as u64);

    let found = discover(&check, &cache, &opts, Some(&on_progress)).await;
    pb.finish_and_clear();

    match found {
        Some(port) => {
            println!("{}", port);
            Ok(())
        }
        None => anyhow::bail!("no running vidgrab server in {}-{}", opts.range_start, opts.range_end),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = EngineRegistry::with_defaults();
    let app = build_cli(&registry);
    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("serve", m)) => run_serve(registry, m).await,
        Some(("discover", m)) => run_discover(m).await,
        _ => Ok(()),
    }
}
