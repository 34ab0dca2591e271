use anyhow::Context;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Logs go to stderr, or to a daily rolling file
/// when `log_dir` is set; the returned guard must live as long as the process.
pub fn init(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "vidgrab.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber).context("install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber).context("install tracing subscriber")?;
            Ok(None)
        }
    }
}
