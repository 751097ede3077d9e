//! File-based tracing setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_FILE_NAME: &str = "boxwarden.log";

/// Filter directives for boxwarden hosts; `RUST_LOG` is used when unset.
pub const LOG_ENV_VAR: &str = "BOXWARDEN_LOG";

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the file-backed tracing subscriber.
///
/// Hosts embedding the library call this once at startup; later calls are
/// no-ops. The filter comes from `BOXWARDEN_LOG`, then `RUST_LOG`, and
/// defaults to `info`.
pub fn init() -> Result<()> {
    init_at(None)
}

/// Like [`init`], but logs to `log_path` instead of the XDG state directory.
pub fn init_at(log_path: Option<&Path>) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let log_path = match log_path {
        Some(path) => path.to_path_buf(),
        None => determine_log_path()?,
    };
    init_inner(&log_path)?;
    let _ = INIT.set(());
    Ok(())
}

fn init_inner(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(log_path)?;
    let file_appender = rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    let version = env!("CARGO_PKG_VERSION");
    tracing::info!(
        version = %version,
        log_path = %log_path.display(),
        pid = std::process::id(),
        "boxwarden:logging started"
    );
    Ok(())
}

fn determine_log_path() -> Result<PathBuf> {
    // Check XDG_STATE_HOME environment variable first
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home)
            .join("boxwarden")
            .join(LOG_FILE_NAME));
    }

    // XDG default: ~/.local/state/boxwarden/boxwarden.log
    if let Some(home_dir) = home::home_dir() {
        return Ok(home_dir
            .join(".local")
            .join("state")
            .join("boxwarden")
            .join(LOG_FILE_NAME));
    }

    Ok(std::env::current_dir()?.join(LOG_FILE_NAME))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
