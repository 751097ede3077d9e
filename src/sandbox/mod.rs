//! One isolated environment and the file/command operations proxied into it.
//!
//! A controller moves through `Uninitialized -> Running -> Stopped`. The first
//! operation on an uninitialized controller starts it; a stopped controller
//! refuses every operation until [`SandboxController::start`] is called
//! again, which provisions a fresh environment under the same id.
//!
//! Operations on one controller are serialized; different controllers are
//! independent.

mod paths;
mod search;

pub use paths::{check_allowed, is_under, normalize};

use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{Backend, ExecBackend};
use crate::engine::{
    Engine, EntryInfo, EnvironmentHandle, EnvironmentSpec, ExecRequest, FileContent, VolumeMount,
};
use crate::error::{Error, Result};
use crate::pattern::PatternMatcher;
use crate::types::{EditOutcome, ExecuteResult, FileInfo, GrepMatch, RuntimeConfig, WriteOutcome};
use search::SearchFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Uninitialized,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub exec_timeout: Duration,
    pub max_output_bytes: usize,
    pub setup_timeout: Duration,
    /// Internal path prefixes file operations may touch; empty allows all.
    pub allowed_paths: Vec<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(120),
            max_output_bytes: 100_000,
            setup_timeout: Duration::from_secs(300),
            allowed_paths: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SandboxState,
    handle: Option<Arc<EnvironmentHandle>>,
}

#[derive(Debug)]
pub struct SandboxController {
    id: String,
    runtime: RuntimeConfig,
    volumes: Vec<VolumeMount>,
    options: SandboxOptions,
    engine: Arc<dyn Engine>,
    lifecycle: Mutex<Lifecycle>,
    /// Held for the whole of every operation, start and stop.
    ops: Mutex<()>,
    last_active: Mutex<Instant>,
    in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the controller busy for the lifetime of one operation.
struct BusyGuard<'a>(&'a SandboxController);

impl<'a> BusyGuard<'a> {
    fn enter(controller: &'a SandboxController) -> Self {
        controller.in_flight.fetch_add(1, Ordering::SeqCst);
        controller.touch();
        Self(controller)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SandboxController {
    pub fn new(id: impl Into<String>, runtime: RuntimeConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            id: id.into(),
            runtime,
            volumes: Vec::new(),
            options: SandboxOptions::default(),
            engine,
            lifecycle: Mutex::new(Lifecycle {
                state: SandboxState::Uninitialized,
                handle: None,
            }),
            ops: Mutex::new(()),
            last_active: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_volumes(mut self, volumes: Vec<VolumeMount>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_options(mut self, options: SandboxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn volumes(&self) -> &[VolumeMount] {
        &self.volumes
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn state(&self) -> SandboxState {
        lock(&self.lifecycle).state
    }

    /// Name of the current environment incarnation, while running.
    pub fn environment_name(&self) -> Option<String> {
        lock(&self.lifecycle)
            .handle
            .as_ref()
            .map(|h| h.name.clone())
    }

    /// Running, and the engine confirms the environment is live.
    pub fn is_alive(&self) -> bool {
        let handle = {
            let lifecycle = lock(&self.lifecycle);
            match (&lifecycle.state, &lifecycle.handle) {
                (SandboxState::Running, Some(handle)) => Arc::clone(handle),
                _ => return false,
            }
        };
        match self.engine.is_alive(&handle) {
            Ok(alive) => alive,
            Err(e) => {
                debug!(sandbox_id = %self.id, error = %e, "sandbox:liveness check failed");
                false
            }
        }
    }

    pub fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// An operation is currently running (or waiting to run).
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Provision the environment. A no-op while running.
    pub fn start(&self) -> Result<()> {
        let _serial = lock(&self.ops);
        self.start_locked().map(|_| ())
    }

    /// Release the environment. A no-op unless running.
    pub fn stop(&self) -> Result<()> {
        let _serial = lock(&self.ops);
        let handle = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != SandboxState::Running {
                return Ok(());
            }
            lifecycle.state = SandboxState::Stopped;
            lifecycle.handle.take()
        };

        if let Some(handle) = handle {
            info!(sandbox_id = %self.id, environment = %handle.name, "sandbox:stop");
            if let Err(e) = self.engine.remove(&handle) {
                warn!(sandbox_id = %self.id, error = %e, "sandbox:failed to remove environment");
                // Keep ownership of the environment so a later stop can retry.
                let mut lifecycle = lock(&self.lifecycle);
                lifecycle.state = SandboxState::Running;
                lifecycle.handle = Some(handle);
                return Err(Error::Engine(e));
            }
        }
        Ok(())
    }

    /// Caller must hold `ops`.
    fn start_locked(&self) -> Result<Arc<EnvironmentHandle>> {
        {
            let lifecycle = lock(&self.lifecycle);
            if lifecycle.state == SandboxState::Running
                && let Some(handle) = &lifecycle.handle
            {
                return Ok(Arc::clone(handle));
            }
        }

        let spec = EnvironmentSpec {
            name: environment_name(&self.id),
            runtime: self.runtime.clone(),
            volumes: self.volumes.clone(),
            setup_timeout: self.options.setup_timeout,
        };
        info!(
            sandbox_id = %self.id,
            environment = %spec.name,
            engine = self.engine.kind(),
            image = %spec.runtime.base_image,
            "sandbox:start"
        );
        let handle = Arc::new(self.engine.create(&spec)?);

        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.state = SandboxState::Running;
        lifecycle.handle = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Caller must hold `ops`.
    fn ensure_running(&self) -> Result<Arc<EnvironmentHandle>> {
        let state = self.state();
        match state {
            SandboxState::Stopped => Err(Error::SandboxStopped {
                id: self.id.clone(),
            }),
            SandboxState::Uninitialized | SandboxState::Running => self.start_locked(),
        }
    }

    fn run_op<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&EnvironmentHandle) -> Result<T>,
    ) -> Result<T> {
        let _busy = BusyGuard::enter(self);
        let _serial = lock(&self.ops);
        let handle = self.ensure_running()?;
        debug!(sandbox_id = %self.id, operation, "sandbox:op");
        f(&handle)
    }

    fn read_bytes(&self, handle: &EnvironmentHandle, path: &str) -> Result<Vec<u8>> {
        match self.engine.read_file(handle, path)? {
            FileContent::Bytes(bytes) => Ok(bytes),
            FileContent::NotFound => Err(Error::NotFound(path.to_string())),
            FileContent::IsDirectory => Err(Error::IsDirectory(path.to_string())),
        }
    }

    fn stat_existing(&self, handle: &EnvironmentHandle, path: &str) -> Result<EntryInfo> {
        self.engine
            .stat(handle, path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }
}

impl Backend for SandboxController {
    fn resolve(&self, path: &str) -> Result<String> {
        let normalized = normalize(path, &self.runtime.work_dir)?;
        check_allowed(&normalized, &self.options.allowed_paths)?;
        Ok(normalized)
    }

    fn ls(&self, path: &str) -> Result<Vec<FileInfo>> {
        let target = self.resolve(path)?;
        self.run_op("ls", |handle| {
            let entry = self.stat_existing(handle, &target)?;
            let mut entries = if entry.is_dir {
                self.engine.list_dir(handle, &target)?
            } else {
                vec![entry]
            };
            entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name().cmp(b.name())));
            Ok(entries.into_iter().map(file_info).collect())
        })
    }

    fn read(&self, path: &str, offset: usize, limit: usize) -> Result<String> {
        let target = self.resolve(path)?;
        self.run_op("read", |handle| {
            let bytes = self.read_bytes(handle, &target)?;
            Ok(number_lines(&String::from_utf8_lossy(&bytes), offset, limit))
        })
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<WriteOutcome> {
        let target = self.resolve(path)?;
        self.run_op("write", |handle| {
            self.engine.write_file(handle, &target, content)?;
            debug!(sandbox_id = %self.id, path = %target, bytes = content.len(), "sandbox:write");
            Ok(WriteOutcome { path: target.clone() })
        })
    }

    fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> Result<EditOutcome> {
        if old.is_empty() {
            return Err(Error::InvalidEdit("old string must not be empty".to_string()));
        }
        let target = self.resolve(path)?;
        self.run_op("edit", |handle| {
            let bytes = self.read_bytes(handle, &target)?;
            let positions = find_all(&bytes, old.as_bytes());
            match positions.len() {
                0 => {
                    return Err(Error::EditNotFound {
                        path: target.clone(),
                        needle: old.to_string(),
                    });
                }
                1 => {}
                n if !replace_all => {
                    return Err(Error::EditAmbiguous {
                        path: target.clone(),
                        needle: old.to_string(),
                        occurrences: n,
                    });
                }
                _ => {}
            }

            let updated = splice(&bytes, &positions, old.len(), new.as_bytes());
            self.engine.write_file(handle, &target, &updated)?;
            Ok(EditOutcome {
                path: target.clone(),
                occurrences: positions.len(),
            })
        })
    }

    fn glob(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        let matcher = PatternMatcher::new(pattern)?;
        let root = self.resolve(path)?;
        let absolute = pattern.starts_with('/');
        self.run_op("glob", |handle| {
            let root_entry = self.stat_existing(handle, &root)?;
            if !root_entry.is_dir {
                return Ok(Vec::new());
            }
            let mut found: Vec<FileInfo> = self
                .engine
                .walk(handle, &root)?
                .into_iter()
                .filter(|entry| !entry.is_dir)
                .filter(|entry| {
                    if absolute {
                        matcher.is_match(&entry.path)
                    } else {
                        search::relative_to(&entry.path, &root)
                            .is_some_and(|relative| matcher.is_match(&relative))
                    }
                })
                .map(file_info)
                .collect();
            found.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(found)
        })
    }

    fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
        ignore_hidden: bool,
    ) -> Result<Vec<GrepMatch>> {
        let regex = Regex::new(pattern).map_err(|e| Error::invalid_pattern(pattern, e))?;
        let glob = glob.map(PatternMatcher::new).transpose()?;
        let root = self.resolve(path)?;

        self.run_op("grep", |handle| {
            let root_entry = self.stat_existing(handle, &root)?;
            let filter = SearchFilter::new(&root, !root_entry.is_dir, glob, ignore_hidden);

            let mut matches: Vec<GrepMatch> = match self.engine.search(handle, pattern, &root)? {
                Some(raw) => raw
                    .into_iter()
                    .filter(|m| filter.accepts(&m.path))
                    .map(GrepMatch::from)
                    .collect(),
                None => {
                    let files = if root_entry.is_dir {
                        self.engine.walk(handle, &root)?
                    } else {
                        vec![root_entry]
                    };
                    let mut matches = Vec::new();
                    for file in files.iter().filter(|f| !f.is_dir && filter.accepts(&f.path)) {
                        if let FileContent::Bytes(bytes) = self.engine.read_file(handle, &file.path)? {
                            matches.extend(search::scan(&regex, &file.path, &bytes));
                        }
                    }
                    matches
                }
            };
            matches.sort_by(|a, b| {
                a.path
                    .cmp(&b.path)
                    .then_with(|| a.line_number.cmp(&b.line_number))
            });
            Ok(matches)
        })
    }
}

impl ExecBackend for SandboxController {
    fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<ExecuteResult> {
        let timeout = timeout.unwrap_or(self.options.exec_timeout);
        self.run_op("execute", |handle| {
            let result = self.engine.exec(
                handle,
                &ExecRequest {
                    command,
                    timeout,
                    max_output: self.options.max_output_bytes,
                },
            )?;
            if result.timed_out {
                warn!(sandbox_id = %self.id, timeout_secs = timeout.as_secs_f64(), "sandbox:execute timed out");
            }
            Ok(result)
        })
    }
}

fn file_info(entry: EntryInfo) -> FileInfo {
    FileInfo {
        name: entry.name().to_string(),
        is_dir: entry.is_dir,
        size: (!entry.is_dir).then_some(entry.size),
        path: entry.path,
    }
}

fn number_lines(text: &str, offset: usize, limit: usize) -> String {
    text.lines()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(i, line)| format!("{:>6}\t{}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Start offsets of non-overlapping occurrences of `needle`.
fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            positions.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    positions
}

fn splice(bytes: &[u8], positions: &[usize], old_len: usize, new: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + positions.len() * new.len());
    let mut last = 0;
    for &pos in positions {
        out.extend_from_slice(&bytes[last..pos]);
        out.extend_from_slice(new);
        last = pos + old_len;
    }
    out.extend_from_slice(&bytes[last..]);
    out
}

/// Fresh environment name for one incarnation of sandbox `id`.
fn environment_name(id: &str) -> String {
    let base = slug::slugify(id);
    let base = if base.is_empty() { "sandbox".to_string() } else { base };
    format!("boxwarden-{}-{}", base, random_hex(4))
}

pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    if getrandom::fill(&mut buf).is_err() {
        // Fall back to clock entropy; names only need to be unlikely to collide.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (nanos >> ((i % 16) * 8)) as u8;
        }
    }
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use crate::engine::testing::StuckRemove;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _base: TempDir,
        volume: TempDir,
        sandbox: SandboxController,
    }

    fn fixture() -> Fixture {
        fixture_with(SandboxOptions::default())
    }

    fn fixture_with(options: SandboxOptions) -> Fixture {
        let base = TempDir::new().unwrap();
        let volume = TempDir::new().unwrap();
        let engine = Arc::new(ProcessEngine::new(base.path()));
        let sandbox = SandboxController::new("test-box", RuntimeConfig::default(), engine)
            .with_volumes(vec![VolumeMount::new(volume.path(), "/workspace")])
            .with_options(options);
        Fixture {
            _base: base,
            volume,
            sandbox,
        }
    }

    #[test]
    fn write_then_read_numbers_lines() {
        let f = fixture();
        f.sandbox.write("/f.txt", b"a\nb\nc").unwrap();
        let text = f.sandbox.read("/f.txt", 0, 10).unwrap();
        assert_eq!(text, "     1\ta\n     2\tb\n     3\tc");
    }

    #[test]
    fn read_window_and_past_end() {
        let f = fixture();
        f.sandbox.write("lines.txt", b"1\n2\n3\n4\n5\n").unwrap();
        assert_eq!(f.sandbox.read("lines.txt", 1, 2).unwrap(), "     2\t2\n     3\t3");
        assert_eq!(f.sandbox.read("lines.txt", 3, 100).unwrap(), "     4\t4\n     5\t5");
        assert_eq!(f.sandbox.read("lines.txt", 50, 10).unwrap(), "");
    }

    #[test]
    fn read_default_applies_line_limit() {
        let f = fixture();
        let body: String = (1..=2500).map(|i| format!("{}\n", i)).collect();
        f.sandbox.write("long.txt", body.as_bytes()).unwrap();

        let text = f.sandbox.read_default("long.txt").unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), crate::backend::DEFAULT_READ_LIMIT);
        assert_eq!(lines[0], "     1\t1");
        assert_eq!(lines[1999], "  2000\t2000");
    }

    #[test]
    fn read_errors_are_typed() {
        let f = fixture();
        assert!(matches!(f.sandbox.read("missing.txt", 0, 10), Err(Error::NotFound(_))));
        assert!(matches!(f.sandbox.read("/workspace", 0, 10), Err(Error::IsDirectory(_))));
    }

    #[test]
    fn first_operation_starts_lazily() {
        let f = fixture();
        assert_eq!(f.sandbox.state(), SandboxState::Uninitialized);
        assert!(!f.sandbox.is_alive());
        f.sandbox.write("a.txt", b"x").unwrap();
        assert_eq!(f.sandbox.state(), SandboxState::Running);
        assert!(f.sandbox.is_alive());
    }

    #[test]
    fn start_is_idempotent_and_restart_is_a_new_environment() {
        let f = fixture();
        f.sandbox.start().unwrap();
        let first = f.sandbox.environment_name().unwrap();
        f.sandbox.start().unwrap();
        assert_eq!(f.sandbox.environment_name().unwrap(), first);

        f.sandbox.stop().unwrap();
        assert!(f.sandbox.environment_name().is_none());
        f.sandbox.start().unwrap();
        let second = f.sandbox.environment_name().unwrap();
        assert_ne!(first, second);
        assert!(second.starts_with("boxwarden-test-box-"));
    }

    #[test]
    fn stopped_sandbox_refuses_operations_without_side_effects() {
        let f = fixture();
        f.sandbox.start().unwrap();
        f.sandbox.stop().unwrap();
        assert!(!f.sandbox.is_alive());
        assert_eq!(f.sandbox.state(), SandboxState::Stopped);

        let err = f.sandbox.write("/workspace/new.txt", b"x").unwrap_err();
        assert!(matches!(err, Error::SandboxStopped { .. }));
        assert!(!f.volume.path().join("new.txt").exists());

        let err = f.sandbox.execute("touch made.txt", None).unwrap_err();
        assert!(matches!(err, Error::SandboxStopped { .. }));
        assert!(!f.volume.path().join("made.txt").exists());

        // Stop is a no-op when not running.
        f.sandbox.stop().unwrap();
    }

    #[test]
    fn explicit_start_revives_a_stopped_sandbox() {
        let f = fixture();
        f.sandbox.write("keep.txt", b"kept").unwrap();
        f.sandbox.stop().unwrap();
        f.sandbox.start().unwrap();
        assert_eq!(f.sandbox.read("keep.txt", 0, 10).unwrap(), "     1\tkept");
    }

    #[test]
    fn failed_setup_leaves_state_unchanged() {
        let base = TempDir::new().unwrap();
        let mut runtime = RuntimeConfig::default();
        runtime.setup_commands = vec!["exit 1".to_string()];
        let sandbox =
            SandboxController::new("broken", runtime, Arc::new(ProcessEngine::new(base.path())));

        assert!(matches!(sandbox.start(), Err(Error::Engine(_))));
        assert_eq!(sandbox.state(), SandboxState::Uninitialized);
        assert!(sandbox.environment_name().is_none());
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_remove_keeps_environment_for_retry() {
        let base = TempDir::new().unwrap();
        let engine = Arc::new(StuckRemove::new(base.path()));
        let sandbox = SandboxController::new("stuck", RuntimeConfig::default(), engine.clone());
        sandbox.start().unwrap();
        let name = sandbox.environment_name().unwrap();

        assert!(matches!(sandbox.stop(), Err(Error::Engine(_))));
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(sandbox.environment_name().as_deref(), Some(name.as_str()));
        assert!(sandbox.is_alive());

        engine.set_failing(false);
        sandbox.stop().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Stopped);
        assert!(sandbox.environment_name().is_none());
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn execute_returns_while_background_job_runs() {
        let f = fixture();
        let started = Instant::now();
        let result = f
            .sandbox
            .execute("sleep 6 & echo hi", Some(Duration::from_secs(1)))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(result.output.trim(), "hi");
        assert!(!result.timed_out);
    }

    #[test]
    fn edit_requires_unique_match_unless_replace_all() {
        let f = fixture();
        f.sandbox.write("foo.txt", b"foo foo").unwrap();

        let err = f.sandbox.edit("foo.txt", "foo", "bar", false).unwrap_err();
        assert!(matches!(err, Error::EditAmbiguous { occurrences: 2, .. }));
        assert_eq!(fs::read(f.volume.path().join("foo.txt")).unwrap(), b"foo foo");

        let outcome = f.sandbox.edit("foo.txt", "foo", "bar", true).unwrap();
        assert_eq!(outcome.occurrences, 2);
        assert_eq!(fs::read(f.volume.path().join("foo.txt")).unwrap(), b"bar bar");
    }

    #[test]
    fn edit_not_found_and_empty_needle() {
        let f = fixture();
        f.sandbox.write("a.txt", b"hello").unwrap();
        assert!(matches!(
            f.sandbox.edit("a.txt", "absent", "x", false),
            Err(Error::EditNotFound { .. })
        ));
        assert!(matches!(
            f.sandbox.edit("a.txt", "", "x", true),
            Err(Error::InvalidEdit(_))
        ));
        assert_eq!(fs::read(f.volume.path().join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn edit_handles_multiline_and_quotes() {
        let f = fixture();
        let original = "def f():\n    return 'a'\n\ndef g():\n    return \"$HOME\"\n";
        f.sandbox.write("m.py", original.as_bytes()).unwrap();
        let outcome = f
            .sandbox
            .edit("m.py", "def g():\n    return \"$HOME\"", "def g():\n    return `x` & 'y'", false)
            .unwrap();
        assert_eq!(outcome.occurrences, 1);
        let text = fs::read_to_string(f.volume.path().join("m.py")).unwrap();
        assert_eq!(text, "def f():\n    return 'a'\n\ndef g():\n    return `x` & 'y'\n");
    }

    #[test]
    fn ls_sorts_directories_first() {
        let f = fixture();
        f.sandbox.write("b.txt", b"bb").unwrap();
        f.sandbox.write("a.txt", b"a").unwrap();
        f.sandbox.write("zdir/inner.txt", b"").unwrap();

        let entries = f.sandbox.ls("/workspace").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "a.txt", "b.txt"]);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[2].size, Some(2));
        assert_eq!(entries[1].path, "/workspace/a.txt");

        let single = f.sandbox.ls("b.txt").unwrap();
        assert_eq!(single.len(), 1);
        assert!(matches!(f.sandbox.ls("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn glob_matches_relative_paths() {
        let f = fixture();
        for path in ["src/main.py", "src/pkg/util.py", "README.md", "setup.py"] {
            f.sandbox.write(path, b"").unwrap();
        }
        let found: Vec<_> = f
            .sandbox
            .glob("**/*.py", "/workspace")
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            found,
            vec![
                "/workspace/setup.py",
                "/workspace/src/main.py",
                "/workspace/src/pkg/util.py"
            ]
        );

        let top: Vec<_> = f
            .sandbox
            .glob("*.py", "/workspace")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(top, vec!["setup.py"]);

        let absolute = f.sandbox.glob("/workspace/src/*.py", "/workspace").unwrap();
        assert_eq!(absolute.len(), 1);
    }

    #[test]
    fn grep_excludes_hidden_files_by_default() {
        let f = fixture();
        f.sandbox.write(".env", b"API_KEY=1\n").unwrap();
        f.sandbox.write("app.py", b"API_KEY = load()\n").unwrap();

        let visible = f.sandbox.grep("API_KEY", "/workspace", None, true).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].path, "/workspace/app.py");
        assert_eq!(visible[0].line_number, 1);

        let all = f.sandbox.grep("API_KEY", "/workspace", None, false).unwrap();
        let paths: Vec<_> = all.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/workspace/.env", "/workspace/app.py"]);
    }

    #[test]
    fn grep_glob_filter_and_single_file() {
        let f = fixture();
        f.sandbox.write("a.py", b"needle\nhay\nneedle again\n").unwrap();
        f.sandbox.write("b.md", b"needle\n").unwrap();

        let py = f.sandbox.grep("needle", ".", Some("*.py"), true).unwrap();
        assert_eq!(py.len(), 2);
        assert!(py.iter().all(|m| m.path == "/workspace/a.py"));
        assert_eq!(py[1].line_number, 3);

        let single = f.sandbox.grep("needle", "b.md", None, true).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn grep_rejects_bad_regex_before_starting() {
        let f = fixture();
        let err = f.sandbox.grep("(unclosed", ".", None, true).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
        assert_eq!(f.sandbox.state(), SandboxState::Uninitialized);
    }

    #[test]
    fn execute_captures_output_and_exit_code() {
        let f = fixture();
        let result = f.sandbox.execute("echo hello; exit 2", None).unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.output.trim(), "hello");
        assert!(!result.timed_out);
    }

    #[test]
    fn execute_passes_multiline_quoted_commands_verbatim() {
        let f = fixture();
        let command = "cat > script.txt <<'EOF'\nit's \"quoted\" $HOME\nEOF\ncat script.txt";
        let result = f.sandbox.execute(command, None).unwrap();
        assert_eq!(result.output.trim(), "it's \"quoted\" $HOME");
    }

    #[test]
    fn execute_honours_hard_timeout() {
        let f = fixture();
        let started = Instant::now();
        let result = f
            .sandbox
            .execute("sleep 10", Some(Duration::from_secs(1)))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[test]
    fn execute_truncates_large_output() {
        let f = fixture_with(SandboxOptions {
            max_output_bytes: 64,
            ..SandboxOptions::default()
        });
        let result = f.sandbox.execute("seq 1 10000", None).unwrap();
        assert!(result.truncated);
        assert!(result.output.len() <= 64);
        assert!(result.output.starts_with("1\n2\n"));
    }

    #[test]
    fn allowed_paths_are_enforced_before_any_work() {
        let f = fixture_with(SandboxOptions {
            allowed_paths: vec!["/workspace".to_string()],
            ..SandboxOptions::default()
        });
        let err = f.sandbox.read("/etc/passwd", 0, 10).unwrap_err();
        assert!(matches!(err, Error::PathNotAllowed { .. }));
        let err = f.sandbox.write("../escape.txt", b"x").unwrap_err();
        assert!(matches!(err, Error::PathNotAllowed { .. }));
        assert_eq!(f.sandbox.state(), SandboxState::Uninitialized);
    }

    #[test]
    fn operations_refresh_activity() {
        let f = fixture();
        std::thread::sleep(Duration::from_millis(20));
        let before = f.sandbox.idle_for();
        f.sandbox.write("a.txt", b"x").unwrap();
        assert!(f.sandbox.idle_for() < before);
        assert!(!f.sandbox.is_busy());
    }

    #[test]
    fn find_all_is_non_overlapping() {
        assert_eq!(find_all(b"aaaa", b"aa"), vec![0, 2]);
        assert_eq!(find_all(b"abc", b"abcd"), Vec::<usize>::new());
        assert_eq!(splice(b"xaax", &[1], 2, b"b"), b"xbx");
    }
}
