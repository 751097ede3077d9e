//! Permission-gated async access to a sandbox.
//!
//! Every call resolves its target first (path normalisation and allowed-path
//! scope), then asks the permission engine, then runs the operation on the
//! blocking pool. Nothing touches the environment until approval is granted.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, ExecBackend};
use crate::error::{Error, Result};
use crate::permissions::{Operation, PermissionEngine};
use crate::sandbox::SandboxController;
use crate::types::{EditOutcome, ExecuteResult, FileInfo, GrepMatch, WriteOutcome};

#[derive(Debug, Clone)]
pub struct GuardedSandbox {
    sandbox: Arc<SandboxController>,
    permissions: Arc<PermissionEngine>,
}

impl GuardedSandbox {
    pub fn new(sandbox: Arc<SandboxController>, permissions: Arc<PermissionEngine>) -> Self {
        Self {
            sandbox,
            permissions,
        }
    }

    pub fn sandbox(&self) -> &Arc<SandboxController> {
        &self.sandbox
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    pub async fn ls(&self, path: &str, cancel: &CancellationToken) -> Result<Vec<FileInfo>> {
        let target = self.sandbox.resolve(path)?;
        self.permissions
            .authorize(Operation::Ls, &target, "list directory", cancel)
            .await?;
        self.run(move |sandbox| sandbox.ls(&target)).await
    }

    pub async fn read(
        &self,
        path: &str,
        offset: usize,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let target = self.sandbox.resolve(path)?;
        self.permissions
            .authorize(Operation::Read, &target, "read file", cancel)
            .await?;
        self.run(move |sandbox| sandbox.read(&target, offset, limit))
            .await
    }

    pub async fn write(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        let target = self.sandbox.resolve(path)?;
        let content = content.into();
        let reason = format!("write {} bytes", content.len());
        self.permissions
            .authorize(Operation::Write, &target, &reason, cancel)
            .await?;
        self.run(move |sandbox| sandbox.write(&target, &content))
            .await
    }

    pub async fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
        cancel: &CancellationToken,
    ) -> Result<EditOutcome> {
        let target = self.sandbox.resolve(path)?;
        self.permissions
            .authorize(Operation::Edit, &target, "edit file", cancel)
            .await?;
        let (old, new) = (old.to_string(), new.to_string());
        self.run(move |sandbox| sandbox.edit(&target, &old, &new, replace_all))
            .await
    }

    pub async fn glob(
        &self,
        pattern: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileInfo>> {
        let target = self.sandbox.resolve(path)?;
        let reason = format!("glob {pattern}");
        self.permissions
            .authorize(Operation::Glob, &target, &reason, cancel)
            .await?;
        let pattern = pattern.to_string();
        self.run(move |sandbox| sandbox.glob(&pattern, &target))
            .await
    }

    pub async fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
        ignore_hidden: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<GrepMatch>> {
        let target = self.sandbox.resolve(path)?;
        let reason = format!("search for {pattern}");
        self.permissions
            .authorize(Operation::Grep, &target, &reason, cancel)
            .await?;
        let pattern = pattern.to_string();
        let glob = glob.map(str::to_string);
        self.run(move |sandbox| sandbox.grep(&pattern, &target, glob.as_deref(), ignore_hidden))
            .await
    }

    /// The permission target is the literal command text.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult> {
        self.permissions
            .authorize(Operation::Execute, command, "run command", cancel)
            .await?;
        let command = command.to_string();
        self.run(move |sandbox| sandbox.execute(&command, timeout))
            .await
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SandboxController) -> Result<T> + Send + 'static,
    {
        let sandbox = Arc::clone(&self.sandbox);
        tokio::task::spawn_blocking(move || f(&sandbox))
            .await
            .map_err(|e| Error::Engine(anyhow::Error::new(e).context("sandbox task failed")))?
    }
}
