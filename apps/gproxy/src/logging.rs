//! Ambient logging stack (SPEC_FULL.md §B): `tracing` + `tracing-subscriber`
//! to stderr, layered with a non-blocking file appender writing
//! `<config_dir>/proxy.log` (§6's filesystem state table names the file
//! without saying how it is populated — this is the teacher's answer).

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Must be held for the process lifetime: dropping it stops the
/// background thread that flushes buffered log lines to `proxy.log`.
pub struct LoggingGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

pub fn init(config_dir: &Path, log_level: &str) -> LoggingGuard {
    let file_appender = tracing_appender::rolling::never(config_dir, "proxy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false).with_target(false);

    tracing_subscriber::registry().with(env_filter).with(stderr_layer).with(file_layer).init();

    LoggingGuard(guard)
}
