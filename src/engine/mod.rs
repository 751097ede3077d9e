//! Control surface for isolated execution environments.
//!
//! A [`SandboxController`](crate::sandbox::SandboxController) never talks to
//! docker or the filesystem directly; it drives an [`Engine`]. Engines are
//! synchronous per call and report failures as `anyhow` errors, which the
//! controller wraps into [`Error::Engine`](crate::Error::Engine).

mod container;
mod process;
#[cfg(test)]
pub(crate) mod testing;

pub use container::ContainerEngine;
pub use process::ProcessEngine;

use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, EngineKind};
use crate::types::{ExecuteResult, RuntimeConfig};

/// A host directory exposed inside the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    /// Absolute path inside the environment.
    pub target: String,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
        }
    }
}

/// Everything an engine needs to provision one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Unique name for this incarnation (container name, root directory name).
    pub name: String,
    pub runtime: RuntimeConfig,
    pub volumes: Vec<VolumeMount>,
    /// Bound on package installation plus setup commands.
    pub setup_timeout: Duration,
}

/// A provisioned environment. Opaque to everything but its engine.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub name: String,
    pub spec: EnvironmentSpec,
    /// Host directory backing `/` for engines that emulate isolation.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub timeout: Duration,
    pub max_output: usize,
}

/// Metadata for one path inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Absolute path inside the environment.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

impl EntryInfo {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Bytes(Vec<u8>),
    NotFound,
    IsDirectory,
}

/// A match reported by an engine-side search tool, before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

pub trait Engine: fmt::Debug + Send + Sync {
    fn kind(&self) -> &'static str;

    /// Provision an environment: start it, install packages and run setup
    /// commands. A failed setup removes whatever was created.
    fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle>;

    fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest<'_>) -> Result<ExecuteResult>;

    fn is_alive(&self, handle: &EnvironmentHandle) -> Result<bool>;

    /// Release the environment. Volume contents are left alone.
    fn remove(&self, handle: &EnvironmentHandle) -> Result<()>;

    fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<FileContent>;

    /// Replace `path` atomically, creating parent directories.
    fn write_file(&self, handle: &EnvironmentHandle, path: &str, content: &[u8]) -> Result<()>;

    fn stat(&self, handle: &EnvironmentHandle, path: &str) -> Result<Option<EntryInfo>>;

    /// Immediate children of a directory.
    fn list_dir(&self, handle: &EnvironmentHandle, path: &str) -> Result<Vec<EntryInfo>>;

    /// Every entry below `root`, recursively, without following symlinks.
    fn walk(&self, handle: &EnvironmentHandle, root: &str) -> Result<Vec<EntryInfo>>;

    /// Regex search with a native tool. `Ok(None)` means no tool is available
    /// and the caller should scan files itself.
    fn search(
        &self,
        _handle: &EnvironmentHandle,
        _pattern: &str,
        _root: &str,
    ) -> Result<Option<Vec<RawMatch>>> {
        Ok(None)
    }
}

/// Build the engine selected by configuration.
pub fn from_config(config: &EngineConfig) -> Arc<dyn Engine> {
    match config.kind() {
        EngineKind::Container => Arc::new(ContainerEngine::new(
            config.runtime(),
            config.run_as_host_user(),
        )),
        EngineKind::Process => Arc::new(ProcessEngine::new(config.process_root())),
    }
}

/// Parse NUL-separated ripgrep records: `path\0line_number:line\n`.
pub(crate) fn parse_rg_output(stdout: &[u8]) -> Vec<RawMatch> {
    let text = String::from_utf8_lossy(stdout);
    text.split('\n')
        .filter_map(|record| {
            let (path, rest) = record.split_once('\0')?;
            let (number, line) = rest.split_once(':')?;
            Some(RawMatch {
                path: path.to_string(),
                line_number: number.parse().ok()?,
                line: line.strip_suffix('\r').unwrap_or(line).to_string(),
            })
        })
        .collect()
}

pub(crate) const RG_ARGS: &[&str] = &[
    "--null",
    "--line-number",
    "--no-heading",
    "--with-filename",
    "--hidden",
    "--no-ignore",
    // `$` matches before `\r\n`, as the line scanner does.
    "--crlf",
    "--color",
    "never",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rg_records() {
        let stdout = b"/w/a.py\x0012:import os\n/w/b.py\x003:x = 'a:b'\r\n";
        let matches = parse_rg_output(stdout);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].path, "/w/a.py");
        assert_eq!(matches[0].line_number, 12);
        assert_eq!(matches[1].line, "x = 'a:b'");
    }

    #[test]
    fn skips_binary_notices() {
        let stdout = b"/w/blob.bin\x00binary file matches (found \"\\0\" byte around offset 4)\n";
        assert!(parse_rg_output(stdout).is_empty());
    }

    #[test]
    fn entry_name_is_last_segment() {
        let entry = EntryInfo {
            path: "/workspace/src/main.py".to_string(),
            is_dir: false,
            size: 10,
        };
        assert_eq!(entry.name(), "main.py");
    }
}
