use anyhow::{Context, Result, anyhow};
use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

use crate::types::ExecuteResult;

/// Exit code reported when a command is killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A builder for executing commands with unified error handling.
///
/// Arguments are passed as an argv list, never through a shell string, so
/// payloads containing quotes or newlines reach the program unchanged.
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<String>,
    workdir: Option<&'a Path>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl<'a> Cmd<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            workdir: None,
            envs: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bytes fed to the child's stdin, which is closed afterwards.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Hard deadline. The child's whole process group is killed when it passes.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute the command and return its output.
    /// Returns an error if the command fails (non-zero exit code) or times out.
    pub fn run(self) -> Result<Output> {
        let command = self.command;
        let args = self.args.clone();
        let output = self.output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command,
                args = ?args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                command,
                args.join(" "),
                stderr.trim()
            ));
        }
        trace!(command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return its output whatever the exit status.
    /// Passing the deadline is an error here.
    pub fn output(self) -> Result<Output> {
        let started = Instant::now();
        let (mut child, label) = self.spawn()?;
        let deadline = self.timeout;

        let stdout = Arc::new(Mutex::new(CappedBuffer::new(usize::MAX)));
        let stderr = Arc::new(Mutex::new(CappedBuffer::new(usize::MAX)));
        let readers = Readers::spawn(vec![
            child.stdout.take().map(|r| (boxed(r), Arc::clone(&stdout))),
            child.stderr.take().map(|r| (boxed(r), Arc::clone(&stderr))),
        ]);

        let status = wait_with_deadline(&mut child, deadline, &label)?;
        reap_group(&child, &readers, drain_budget(started, deadline), &label);

        match status {
            Some(status) => Ok(Output {
                status,
                stdout: take(&stdout).data,
                stderr: take(&stderr).data,
            }),
            None => Err(anyhow!(
                "Command timed out after {}s: {}",
                deadline.map(|d| d.as_secs_f64()).unwrap_or_default(),
                label
            )),
        }
    }

    /// Execute the command, folding stdout and stderr into one stream capped
    /// at `max_output` bytes.
    ///
    /// Non-zero exits and timeouts are reported in the result rather than as
    /// errors; only a failure to spawn or wait is an `Err`. Processes the
    /// command leaves running in its group are killed once it exits, so
    /// background jobs cannot hold the call open past its deadline.
    pub fn run_captured(self, max_output: usize) -> Result<ExecuteResult> {
        let started = Instant::now();
        let (mut child, label) = self.spawn()?;
        let deadline = self.timeout;

        let sink = Arc::new(Mutex::new(CappedBuffer::new(max_output)));
        let readers = Readers::spawn(vec![
            child.stdout.take().map(|r| (boxed(r), Arc::clone(&sink))),
            child.stderr.take().map(|r| (boxed(r), Arc::clone(&sink))),
        ]);

        let status = wait_with_deadline(&mut child, deadline, &label)?;
        reap_group(&child, &readers, drain_budget(started, deadline), &label);
        let (output, truncated) = take(&sink).finish();

        let (exit_code, timed_out) = match status {
            Some(status) => (exit_code(status), false),
            None => (TIMEOUT_EXIT_CODE, true),
        };
        debug!(
            command = %label,
            exit_code,
            timed_out,
            truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cmd:captured"
        );

        Ok(ExecuteResult {
            output,
            exit_code,
            truncated,
            timed_out,
        })
    }

    fn spawn(&self) -> Result<(Child, String)> {
        let label = if self.args.is_empty() {
            self.command.to_string()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        };
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = self.command, args = ?self.args, workdir = ?workdir_display, "cmd:run start");

        let mut cmd = Command::new(self.command);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so a deadline can take down everything the
            // command started.
            .process_group(0);
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", label))?;

        if let Some(data) = self.stdin.clone()
            && let Some(mut pipe) = child.stdin.take()
        {
            // A separate writer keeps a large payload from deadlocking against
            // a child that is blocked writing its own output.
            thread::spawn(move || {
                let _ = pipe.write_all(&data);
            });
        }

        Ok((child, label))
    }
}

/// Wait for `child`, killing its process group once `deadline` passes.
/// Returns `None` when the deadline was hit.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Duration>,
    label: &str,
) -> Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child
            .wait()
            .map(Some)
            .with_context(|| format!("Failed to wait for command: {}", label));
    };

    if let Some(status) = child
        .wait_timeout(deadline)
        .with_context(|| format!("Failed to wait for command: {}", label))?
    {
        return Ok(Some(status));
    }

    warn!(command = %label, timeout_secs = deadline.as_secs_f64(), "cmd:timeout, killing process group");
    kill_process_group(child);
    child
        .wait()
        .with_context(|| format!("Failed to reap timed out command: {}", label))?;
    Ok(None)
}

fn kill_process_group(child: &mut Child) {
    if let Err(e) = signal_group(child.id()) {
        debug!(error = %e, "cmd:killpg failed, killing child directly");
        let _ = child.kill();
    }
}

fn signal_group(pid: u32) -> nix::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
}

/// Kill whatever is left in the child's process group, then give the output
/// readers at most `budget` to drain. Readers still blocked after that are
/// abandoned along with whatever they would have read.
fn reap_group(child: &Child, readers: &Readers, budget: Duration, label: &str) {
    // ESRCH just means the group is already gone.
    let _ = signal_group(child.id());
    if !readers.wait(budget) {
        warn!(command = %label, "cmd:output still open after exit, abandoning readers");
    }
}

/// Time left for draining output: what remains of the deadline, but never
/// less than a short grace period for data already in the pipes.
fn drain_budget(started: Instant, deadline: Option<Duration>) -> Duration {
    deadline
        .map(|d| d.saturating_sub(started.elapsed()))
        .unwrap_or_default()
        .max(DRAIN_GRACE)
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

type Stream = (Box<dyn Read + Send>, Arc<Mutex<CappedBuffer>>);

fn boxed<R: Read + Send + 'static>(reader: R) -> Box<dyn Read + Send> {
    Box::new(reader)
}

fn take(sink: &Mutex<CappedBuffer>) -> CappedBuffer {
    let mut guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
    let limit = guard.limit;
    std::mem::replace(&mut *guard, CappedBuffer::new(limit))
}

/// Output pump threads. Each reports on `done` when its stream hits EOF.
struct Readers {
    done: Receiver<()>,
    count: usize,
}

impl Readers {
    fn spawn(streams: Vec<Option<Stream>>) -> Self {
        let (tx, done) = mpsc::channel();
        let mut count = 0;
        for (reader, sink) in streams.into_iter().flatten() {
            let tx = tx.clone();
            thread::spawn(move || {
                pump_output(reader, &sink);
                let _ = tx.send(());
            });
            count += 1;
        }
        Self { done, count }
    }

    /// True once every stream is drained; false if `budget` ran out first.
    fn wait(&self, budget: Duration) -> bool {
        let until = Instant::now() + budget;
        for _ in 0..self.count {
            let left = until.saturating_duration_since(Instant::now());
            if self.done.recv_timeout(left).is_err() {
                return false;
            }
        }
        true
    }
}

fn pump_output<R: Read>(mut reader: R, sink: &Mutex<CappedBuffer>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(&buf[..n]),
            Err(_) => break,
        }
    }
}

/// Byte buffer that keeps the first `limit` bytes and remembers whether more
/// arrived. Readers keep draining past the limit so the child never blocks.
struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(mut self) -> (String, bool) {
        if self.truncated {
            // Drop a multi-byte character split by the cap.
            if let Err(e) = std::str::from_utf8(&self.data)
                && e.error_len().is_none()
            {
                self.data.truncate(e.valid_up_to());
            }
        }
        (String::from_utf8_lossy(&self.data).into_owned(), self.truncated)
    }
}
