//! Engine doubles for unit tests.

use anyhow::{Result, bail};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    Engine, EntryInfo, EnvironmentHandle, EnvironmentSpec, ExecRequest, FileContent,
    ProcessEngine,
};
use crate::types::ExecuteResult;

/// Process engine whose `remove` fails until `set_failing(false)`.
#[derive(Debug)]
pub(crate) struct StuckRemove {
    inner: ProcessEngine,
    failing: AtomicBool,
}

impl StuckRemove {
    pub(crate) fn new(base: &Path) -> Self {
        Self {
            inner: ProcessEngine::new(base),
            failing: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Engine for StuckRemove {
    fn kind(&self) -> &'static str {
        "stuck"
    }

    fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        self.inner.create(spec)
    }

    fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest<'_>) -> Result<ExecuteResult> {
        self.inner.exec(handle, request)
    }

    fn is_alive(&self, handle: &EnvironmentHandle) -> Result<bool> {
        self.inner.is_alive(handle)
    }

    fn remove(&self, handle: &EnvironmentHandle) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("daemon unavailable");
        }
        self.inner.remove(handle)
    }

    fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<FileContent> {
        self.inner.read_file(handle, path)
    }

    fn write_file(&self, handle: &EnvironmentHandle, path: &str, content: &[u8]) -> Result<()> {
        self.inner.write_file(handle, path, content)
    }

    fn stat(&self, handle: &EnvironmentHandle, path: &str) -> Result<Option<EntryInfo>> {
        self.inner.stat(handle, path)
    }

    fn list_dir(&self, handle: &EnvironmentHandle, path: &str) -> Result<Vec<EntryInfo>> {
        self.inner.list_dir(handle, path)
    }

    fn walk(&self, handle: &EnvironmentHandle, root: &str) -> Result<Vec<EntryInfo>> {
        self.inner.walk(handle, root)
    }
}
