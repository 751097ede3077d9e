//! Capability traits shared by everything that can host agent file work.

use std::time::Duration;

use crate::error::Result;
use crate::types::{EditOutcome, ExecuteResult, FileInfo, GrepMatch, WriteOutcome};

/// Line window used by [`Backend::read_default`].
pub const DEFAULT_READ_LIMIT: usize = 2000;

/// File operations. Paths may be absolute or relative to the backend's
/// working directory.
pub trait Backend: Send + Sync {
    /// Normalise a caller path into the backend's namespace, rejecting paths
    /// outside the permitted scope. Pure: never touches the environment.
    fn resolve(&self, path: &str) -> Result<String>;

    fn ls(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Lines `[offset, offset + limit)`, each prefixed with its 1-based number.
    fn read(&self, path: &str, offset: usize, limit: usize) -> Result<String>;

    /// The first [`DEFAULT_READ_LIMIT`] lines.
    fn read_default(&self, path: &str) -> Result<String> {
        self.read(path, 0, DEFAULT_READ_LIMIT)
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<WriteOutcome>;

    /// Replace `old` with `new`. Unless `replace_all` is set, `old` must occur
    /// exactly once. The file is untouched on any error.
    fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> Result<EditOutcome>;

    fn glob(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>>;

    fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
        ignore_hidden: bool,
    ) -> Result<Vec<GrepMatch>>;
}

/// Backends that can also run commands.
pub trait ExecBackend: Backend {
    /// `None` uses the backend's default timeout.
    fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<ExecuteResult>;
}
