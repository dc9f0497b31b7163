//! Process wide `tracing` setup.

use anyhow::Context as _;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;

/// Initializes logging: stderr in debug builds, a daily rolling file under
/// `<storage_path>/logs` in release builds. Calling it twice is harmless.
#[allow(unused_variables)]
pub fn init(storage_path: Option<&Path>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        let log_dir = log_dir(storage_path);
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "layerproxy");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Logging lasts until the process exits.
        std::mem::forget(guard);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("layerproxy v{} starting, log level {}", crate::VERSION, level);
    Ok(())
}

/// Where release builds write their log files.
pub fn log_dir(storage_path: Option<&Path>) -> PathBuf {
    storage_path
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Log level from `RUST_LOG`, INFO if unset or unknown.
pub fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => parse_level(&val).unwrap_or(LevelFilter::INFO),
        Err(_) => LevelFilter::INFO,
    }
}

fn parse_level(val: &str) -> Option<LevelFilter> {
    Some(match val.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => return None,
    })
}

/// Checks that a log directory can be created, for config validation.
pub fn ensure_log_dir(storage_path: &Path) -> anyhow::Result<PathBuf> {
    let dir = log_dir(Some(storage_path));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    Ok(dir)
}
