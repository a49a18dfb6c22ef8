//! Tracing initialization for processes embedding the environment.
//! Builds a subscriber with EnvFilter, supports compact or JSON formats, and optional file logging.
//!
//! Behavior:
//! - Log level is driven by LogLevel (no RUST_LOG override here).
//! - JSON/non-JSON stdout formatting is selected via the `json` flag.
//! - If `log_file` is provided and can be opened, a non-blocking file layer is added.
//! - Uses `try_init`: a process that already installed a subscriber gets an error, not a panic.

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt as stdfmt;
use std::fs::OpenOptions;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt as tsfmt;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogLevel;

/// Human-friendly timestamp formatter (DD/MM/YY HH:MM:SS.mmm)
struct LocalHumanTime;
impl FormatTime for LocalHumanTime {
    fn format_time(&self, w: &mut tsfmt::format::Writer<'_>) -> stdfmt::Result {
        write!(w, "{}", Local::now().format("%d/%m/%y %H:%M:%S%.3f"))
    }
}

#[inline]
fn to_level_filter(lvl: &LogLevel) -> LevelFilter {
    match lvl {
        LogLevel::Quiet => LevelFilter::ERROR,
        LogLevel::Normal => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

#[inline]
fn env_filter_for(lvl: &LogLevel) -> EnvFilter {
    EnvFilter::default().add_directive(to_level_filter(lvl).into())
}

fn open_non_blocking_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log directory '{}'", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file '{}'", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Initialize tracing based on LogLevel and format. Returns an optional WorkerGuard
/// if a file appender is created (must be held until shutdown to flush logs).
pub fn init_tracing(
    lvl: &LogLevel,
    log_file: Option<&Path>,
    json: bool,
) -> Result<Option<WorkerGuard>> {
    let env_filter = env_filter_for(lvl);

    // Optional file layer
    if let Some(path) = log_file {
        let (writer, guard) = open_non_blocking_writer(path)?;
        if json {
            let stdout_layer = tsfmt::layer()
                .event_format(tsfmt::format().json())
                .with_timer(LocalHumanTime)
                .with_thread_ids(true);
            let file_layer = tsfmt::layer()
                .event_format(tsfmt::format().json())
                .with_timer(LocalHumanTime)
                .with_thread_ids(true)
                .with_writer(writer);
            registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init()
                .context("install tracing subscriber")?;
        } else {
            let stdout_layer = tsfmt::layer()
                .with_timer(LocalHumanTime)
                .with_thread_ids(true)
                .compact();
            let file_layer = tsfmt::layer()
                .with_timer(LocalHumanTime)
                .with_thread_ids(true)
                .with_ansi(false)
                .compact()
                .with_writer(writer);
            registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init()
                .context("install tracing subscriber")?;
        }
        return Ok(Some(guard));
    }

    if json {
        let stdout_layer = tsfmt::layer()
            .event_format(tsfmt::format().json())
            .with_timer(LocalHumanTime)
            .with_thread_ids(true);
        registry()
            .with(env_filter)
            .with(stdout_layer)
            .try_init()
            .context("install tracing subscriber")?;
    } else {
        let stdout_layer = tsfmt::layer()
            .with_timer(LocalHumanTime)
            .with_thread_ids(true)
            .compact();
        registry()
            .with(env_filter)
            .with(stdout_layer)
            .try_init()
            .context("install tracing subscriber")?;
    }
    Ok(None)
}
