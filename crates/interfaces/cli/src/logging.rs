use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use somna_config::TelemetryConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Console layer plus a per-run log file under `log_dir`. `RUST_LOG`, when
/// set, replaces both configured levels. Keep the guard alive until exit or
/// buffered file output is lost.
pub(crate) fn init(telemetry: &TelemetryConfig, log_dir: &Path) -> Result<(WorkerGuard, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("could not create log directory {}", log_dir.display()))?;

    let file_name = log_file_name(chrono::Local::now().naive_local());
    let appender = tracing_appender::rolling::never(log_dir, &file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_filter(filter(&telemetry.console_log_level)),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter(&telemetry.file_log_level)),
        )
        .init();

    Ok((guard, log_dir.join(file_name)))
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn log_file_name(at: chrono::NaiveDateTime) -> String {
    format!("somna_{}.log", at.format("%Y%m%d%H%M%S"))
}
