use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber.
///
/// Console output always goes to stderr. With `log_dir` set, a daily rolling
/// `rna_etl.log` is written there as well; keep the returned guard alive
/// until exit so buffered lines get flushed.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // RUST_LOG wins; `info` otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_writer(io::stderr).with_target(false);

    match log_dir {
        Some(dir) => {
            let file_appender = rolling::daily(dir, "rna_etl.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file = fmt::layer().with_writer(non_blocking).with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
