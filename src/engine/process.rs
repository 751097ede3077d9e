//! Host-process engine.
//!
//! Each environment is a private directory standing in for `/`; volumes map
//! internal path prefixes onto host directories. Commands run as ordinary
//! host processes in their own process group, with the host directory behind
//! the working directory as their cwd. This gives file-operation isolation
//! and lifecycle semantics without a container runtime, which makes it the
//! engine of choice for tests and trusted local use.

use anyhow::{Context, Result, anyhow, bail};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    Engine, EntryInfo, EnvironmentHandle, EnvironmentSpec, ExecRequest, FileContent, RG_ARGS,
    RawMatch, parse_rg_output,
};
use crate::cmd::Cmd;
use crate::types::{ExecuteResult, PackageManager};

/// Environment variable pointing commands at the host directory behind `/`.
pub const ROOT_ENV_VAR: &str = "BOXWARDEN_ROOT";

#[derive(Debug, Clone)]
pub struct ProcessEngine {
    base: PathBuf,
}

impl ProcessEngine {
    /// Environments are created as `{base}/{name}/root`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn root<'h>(&self, handle: &'h EnvironmentHandle) -> Result<&'h Path> {
        handle
            .root
            .as_deref()
            .ok_or_else(|| anyhow!("environment '{}' has no root directory", handle.name))
    }

    /// Translate an absolute internal path to the host path behind it.
    fn host_path(&self, handle: &EnvironmentHandle, internal: &str) -> Result<PathBuf> {
        if !internal.starts_with('/') {
            bail!("expected an absolute path, got '{}'", internal);
        }
        if Path::new(internal)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            bail!("path '{}' is not normalised", internal);
        }

        let volume = handle
            .spec
            .volumes
            .iter()
            .filter_map(|v| strip_mount(internal, &v.target).map(|rest| (v, rest)))
            .max_by_key(|(v, _)| v.target.len());
        if let Some((volume, rest)) = volume {
            return Ok(join_relative(&volume.host, rest));
        }

        Ok(join_relative(self.root(handle)?, internal))
    }

    /// True if a volume is mounted strictly below `internal`.
    fn has_mount_below(&self, handle: &EnvironmentHandle, internal: &str) -> bool {
        handle.spec.volumes.iter().any(|v| {
            v.target != internal
                && strip_mount(&v.target, internal).is_some_and(|rest| !rest.is_empty())
        })
    }

    fn read_entries(
        &self,
        handle: &EnvironmentHandle,
        internal: &str,
    ) -> Result<Vec<(EntryInfo, bool)>> {
        let host = self.host_path(handle, internal)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&host)
            .with_context(|| format!("Failed to list {}", host.display()))?
        {
            let entry = entry?;
            let is_symlink = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            let metadata = match fs::metadata(entry.path()) {
                Ok(m) => m,
                // Dangling symlink
                Err(_) => entry.metadata()?,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((
                EntryInfo {
                    path: join_internal(internal, &name),
                    is_dir: metadata.is_dir(),
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                },
                is_symlink,
            ));
        }
        Ok(entries)
    }

    fn walk_into(
        &self,
        handle: &EnvironmentHandle,
        internal: &str,
        out: &mut Vec<EntryInfo>,
    ) -> Result<()> {
        for (entry, is_symlink) in self.read_entries(handle, internal)? {
            let descend = entry.is_dir && !is_symlink;
            let path = entry.path.clone();
            out.push(entry);
            if descend {
                self.walk_into(handle, &path, out)?;
            }
        }
        Ok(())
    }

    fn run_setup(&self, handle: &EnvironmentHandle) -> Result<()> {
        let runtime = &handle.spec.runtime;
        if !runtime.packages.is_empty() && runtime.package_manager != PackageManager::None {
            warn!(
                environment = %handle.name,
                packages = ?runtime.packages,
                "process engine does not install packages; relying on host tools"
            );
        }

        let started = Instant::now();
        for command in &runtime.setup_commands {
            let remaining = handle
                .spec
                .setup_timeout
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO);
            let result = self.exec(
                handle,
                &ExecRequest {
                    command,
                    timeout: remaining,
                    max_output: 16 * 1024,
                },
            )?;
            if !result.success() {
                bail!(
                    "setup command '{}' failed (exit {}{}): {}",
                    command,
                    result.exit_code,
                    if result.timed_out { ", timed out" } else { "" },
                    result.output.trim()
                );
            }
        }
        Ok(())
    }
}

impl Engine for ProcessEngine {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        let root = self.base.join(&spec.name).join("root");
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create environment root {}", root.display()))?;

        let handle = EnvironmentHandle {
            name: spec.name.clone(),
            spec: spec.clone(),
            root: Some(root.clone()),
        };

        let provision = || -> Result<()> {
            for volume in &spec.volumes {
                fs::create_dir_all(&volume.host).with_context(|| {
                    format!("Failed to create volume directory {}", volume.host.display())
                })?;
                // Mount point so the volume shows up when its parent is listed.
                fs::create_dir_all(join_relative(&root, &volume.target))?;
            }
            let work_dir = self.host_path(&handle, &spec.runtime.work_dir)?;
            fs::create_dir_all(&work_dir)
                .with_context(|| format!("Failed to create work dir {}", work_dir.display()))?;
            self.run_setup(&handle)
        };

        if let Err(e) = provision() {
            let _ = self.remove(&handle);
            return Err(e.context(format!("Failed to provision environment '{}'", spec.name)));
        }

        info!(environment = %spec.name, root = %root.display(), "process:created");
        Ok(handle)
    }

    fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest<'_>) -> Result<ExecuteResult> {
        let runtime = &handle.spec.runtime;
        let work_dir = self.host_path(handle, &runtime.work_dir)?;
        let root = self.root(handle)?.display().to_string();

        let mut cmd = Cmd::new(&runtime.shell)
            .args(["-c", request.command])
            .workdir(&work_dir)
            .env(ROOT_ENV_VAR, root)
            .timeout(request.timeout);
        for (key, value) in &runtime.env_vars {
            cmd = cmd.env(key, value);
        }
        cmd.run_captured(request.max_output)
    }

    fn is_alive(&self, handle: &EnvironmentHandle) -> Result<bool> {
        Ok(self.root(handle)?.is_dir())
    }

    fn remove(&self, handle: &EnvironmentHandle) -> Result<()> {
        let dir = self.base.join(&handle.name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", dir.display()));
            }
        }
        debug!(environment = %handle.name, "process:removed");
        Ok(())
    }

    fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<FileContent> {
        let host = self.host_path(handle, path)?;
        match fs::metadata(&host) {
            Ok(m) if m.is_dir() => return Ok(FileContent::IsDirectory),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileContent::NotFound),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path)),
        }
        let bytes = fs::read(&host).with_context(|| format!("Failed to read {}", path))?;
        Ok(FileContent::Bytes(bytes))
    }

    fn write_file(&self, handle: &EnvironmentHandle, path: &str, content: &[u8]) -> Result<()> {
        let host = self.host_path(handle, path)?;
        let parent = host
            .parent()
            .ok_or_else(|| anyhow!("cannot write to '{}'", path))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directories for {}", path))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temporary file for {}", path))?;
        temp.write_all(content)?;
        temp.flush()?;
        temp.persist(&host)
            .map_err(|e| anyhow!("Failed to replace {}: {}", path, e.error))?;
        Ok(())
    }

    fn stat(&self, handle: &EnvironmentHandle, path: &str) -> Result<Option<EntryInfo>> {
        let host = self.host_path(handle, path)?;
        match fs::metadata(&host) {
            Ok(m) => Ok(Some(EntryInfo {
                path: path.to_string(),
                is_dir: m.is_dir(),
                size: if m.is_dir() { 0 } else { m.len() },
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path)),
        }
    }

    fn list_dir(&self, handle: &EnvironmentHandle, path: &str) -> Result<Vec<EntryInfo>> {
        Ok(self
            .read_entries(handle, path)?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    fn walk(&self, handle: &EnvironmentHandle, root: &str) -> Result<Vec<EntryInfo>> {
        let mut out = Vec::new();
        self.walk_into(handle, root, &mut out)?;
        Ok(out)
    }

    fn search(
        &self,
        handle: &EnvironmentHandle,
        pattern: &str,
        root: &str,
    ) -> Result<Option<Vec<RawMatch>>> {
        // rg would only see the empty mount points, not the volumes behind them.
        if self.has_mount_below(handle, root) {
            return Ok(None);
        }
        let Ok(rg) = which::which("rg") else {
            return Ok(None);
        };
        let rg = rg.to_string_lossy().into_owned();
        let host_root = self.host_path(handle, root)?;
        let host_root_str = host_root.to_string_lossy().into_owned();

        let output = Cmd::new(&rg)
            .args(RG_ARGS.iter().copied())
            .args(["-e", pattern, "--", host_root_str.as_str()])
            .timeout(Duration::from_secs(60))
            .output()?;
        // 0: matches, 1: no matches, 2: error (possibly with partial results)
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ if !output.stdout.is_empty() => {}
            _ => bail!(
                "rg failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }

        let matches = parse_rg_output(&output.stdout)
            .into_iter()
            .filter_map(|m| {
                let rest = m.path.strip_prefix(host_root_str.as_str())?;
                let path = if rest.is_empty() {
                    root.to_string()
                } else {
                    join_internal(root, rest.trim_start_matches('/'))
                };
                Some(RawMatch { path, ..m })
            })
            .collect();
        Ok(Some(matches))
    }
}

/// The remainder of `path` below mount target `target`, if it lies there.
fn strip_mount<'p>(path: &'p str, target: &str) -> Option<&'p str> {
    let target = target.trim_end_matches('/');
    if target.is_empty() {
        return Some(path.trim_start_matches('/'));
    }
    let rest = path.strip_prefix(target)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

fn join_relative(base: &Path, internal: &str) -> PathBuf {
    let rest = internal.trim_start_matches('/');
    if rest.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}

fn join_internal(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
