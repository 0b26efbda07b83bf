// ABOUTME: Tracing subscriber setup: env filter, stderr fmt or JSON, and a daily rolling log file
// ABOUTME: The returned guard must live until exit so buffered file logs get flushed

use anyhow::{Context, Result};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "chirp.log";

/// Keeps the non-blocking file writer alive
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. `log_dir` enables the rolling file sink.
pub fn init(json: bool, log_dir: Option<&Path>) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let stderr_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(non_blocking).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: guard })
}

/// Backtrace for the panic log; only captured when RUST_BACKTRACE asks for it
fn panic_backtrace() -> Backtrace {
    Backtrace::capture()
}

/// Log panics through tracing as well as stderr, before the default hook runs
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = panic_backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            tracing::error!(panic = %panic_info, backtrace = %backtrace, "Panic");
        } else {
            tracing::error!(panic = %panic_info, "Panic");
        }
        default_hook(panic_info);
    }));
}
