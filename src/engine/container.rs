//! Docker/Podman container engine.
//!
//! Environments are long-lived detached containers (`sleep infinity` under
//! `--init`). Every operation is a `docker exec` with an argv list; paths and
//! payloads travel as positional parameters or on stdin, never spliced into
//! shell text.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    Engine, EntryInfo, EnvironmentHandle, EnvironmentSpec, ExecRequest, FileContent, RG_ARGS,
    RawMatch, parse_rg_output,
};
use crate::cmd::{Cmd, TIMEOUT_EXIT_CODE};
use crate::config::ContainerRuntime;
use crate::types::ExecuteResult;

/// Extra host-side time granted beyond the in-container `timeout`.
const EXEC_GRACE: Duration = Duration::from_secs(5);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// `timeout -s KILL` reports a killed child as 128 + SIGKILL.
const KILLED_EXIT_CODE: i32 = 137;

const READ_SCRIPT: &str =
    r#"if [ -d "$1" ]; then exit 4; fi; [ -e "$1" ] || exit 3; exec cat -- "$1""#;
const WRITE_SCRIPT: &str = r#"mkdir -p -- "$(dirname -- "$1")" && tmp="$1.tmp.$$" && cat > "$tmp" && mv -f -- "$tmp" "$1""#;
const STAT_SCRIPT: &str = r#"[ -e "$1" ] || exit 3; exec find "$1" -maxdepth 0 -printf '%y\t%s\t%p\0'"#;
const LIST_SCRIPT: &str = r#"[ -d "$1" ] || exit 3; exec find "$1" -mindepth 1 -maxdepth 1 -printf '%y\t%s\t%p\0'"#;
const WALK_SCRIPT: &str =
    r#"[ -e "$1" ] || exit 3; exec find "$1" -mindepth 1 -printf '%y\t%s\t%p\0'"#;
const SEARCH_SCRIPT: &str = r#"command -v rg >/dev/null 2>&1 || exit 127; exec rg "$@""#;

const NOT_FOUND_EXIT: i32 = 3;
const IS_DIR_EXIT: i32 = 4;
const NO_TOOL_EXIT: i32 = 127;

#[derive(Debug, Clone)]
pub struct ContainerEngine {
    runtime: ContainerRuntime,
    run_as_host_user: bool,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running", default)]
    running: bool,
}

impl ContainerEngine {
    pub fn new(runtime: ContainerRuntime, run_as_host_user: bool) -> Self {
        Self {
            runtime,
            run_as_host_user,
        }
    }

    fn binary(&self) -> &'static str {
        self.runtime.binary()
    }

    /// Arguments for `docker run` that provision the long-lived container.
    fn run_args(&self, spec: &EnvironmentSpec) -> Vec<String> {
        let runtime = &spec.runtime;
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--init".into(),
            "--name".into(),
            spec.name.clone(),
            "--workdir".into(),
            runtime.work_dir.clone(),
        ];

        if self.run_as_host_user {
            // SAFETY: getuid/getgid are always safe to call
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            args.push("--user".into());
            args.push(format!("{}:{}", uid, gid));
        }

        for (key, value) in &runtime.env_vars {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }

        for volume in &spec.volumes {
            args.push("--mount".into());
            args.push(format!(
                "type=bind,source={},target={}",
                volume.host.display(),
                volume.target
            ));
        }

        args.push(runtime.base_image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    /// `docker exec` prefix. Setup runs as root so package managers work
    /// even when the container runs as the host user.
    fn exec_args(&self, handle: &EnvironmentHandle, as_root: bool, stdin: bool) -> Vec<String> {
        let mut args: Vec<String> = vec!["exec".into()];
        if stdin {
            args.push("-i".into());
        }
        if as_root && self.run_as_host_user {
            args.push("--user".into());
            args.push("0".into());
        }
        args.push("--workdir".into());
        args.push(handle.spec.runtime.work_dir.clone());
        args.push(handle.name.clone());
        args
    }

    /// Run a fixed script with `path` as `$1`.
    fn script(&self, handle: &EnvironmentHandle, script: &str, args: &[&str]) -> Cmd<'_> {
        Cmd::new(self.binary())
            .args(self.exec_args(handle, false, false))
            .args(["sh", "-c", script, "sh"])
            .args(args.iter().copied())
            .timeout(FILE_OP_TIMEOUT)
    }

    fn run_setup(&self, handle: &EnvironmentHandle) -> Result<()> {
        let runtime = &handle.spec.runtime;
        let started = Instant::now();
        let remaining = || {
            handle
                .spec
                .setup_timeout
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO)
        };

        Cmd::new(self.binary())
            .args(self.exec_args(handle, true, false))
            .args(["mkdir", "-p", runtime.work_dir.as_str()])
            .timeout(remaining())
            .run()
            .context("Failed to create work dir")?;

        for argv in runtime.package_manager.install_commands(&runtime.packages) {
            info!(container = %handle.name, command = %argv.join(" "), "container:install");
            Cmd::new(self.binary())
                .args(self.exec_args(handle, true, false))
                .args(argv.iter().map(String::as_str))
                .timeout(remaining())
                .run()
                .with_context(|| format!("Package installation failed: {}", argv.join(" ")))?;
        }

        for command in &runtime.setup_commands {
            info!(container = %handle.name, command = %command, "container:setup");
            Cmd::new(self.binary())
                .args(self.exec_args(handle, true, false))
                .args([runtime.shell.as_str(), "-c", command.as_str()])
                .timeout(remaining())
                .run()
                .with_context(|| format!("Setup command failed: {}", command))?;
        }
        Ok(())
    }

    fn parse_entries(stdout: &[u8]) -> Vec<EntryInfo> {
        String::from_utf8_lossy(stdout)
            .split('\0')
            .filter_map(parse_entry)
            .collect()
    }
}

/// Parse one `find -printf '%y\t%s\t%p'` record.
fn parse_entry(record: &str) -> Option<EntryInfo> {
    let mut fields = record.splitn(3, '\t');
    let kind = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    let path = fields.next()?;
    if path.is_empty() {
        return None;
    }
    let is_dir = kind == "d";
    Some(EntryInfo {
        path: path.to_string(),
        is_dir,
        size: if is_dir { 0 } else { size },
    })
}

impl Engine for ContainerEngine {
    fn kind(&self) -> &'static str {
        "container"
    }

    fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        let args = self.run_args(spec);
        info!(
            container = %spec.name,
            image = %spec.runtime.base_image,
            runtime = self.binary(),
            "container:create"
        );
        Cmd::new(self.binary())
            .args(args)
            .timeout(spec.setup_timeout)
            .run()
            .with_context(|| format!("Failed to start container '{}'", spec.name))?;

        let handle = EnvironmentHandle {
            name: spec.name.clone(),
            spec: spec.clone(),
            root: None,
        };

        if let Err(e) = self.run_setup(&handle) {
            if let Err(cleanup) = self.remove(&handle) {
                warn!(container = %spec.name, error = %cleanup, "container:cleanup after failed setup");
            }
            return Err(e.context(format!("Failed to provision container '{}'", spec.name)));
        }
        Ok(handle)
    }

    fn exec(&self, handle: &EnvironmentHandle, request: &ExecRequest<'_>) -> Result<ExecuteResult> {
        let secs = request.timeout.as_secs().max(1);
        let secs_arg = secs.to_string();
        let started = Instant::now();
        let mut result = Cmd::new(self.binary())
            .args(self.exec_args(handle, false, false))
            .args(["timeout", "-s", "KILL", secs_arg.as_str()])
            .args([handle.spec.runtime.shell.as_str(), "-c", request.command])
            .timeout(request.timeout + EXEC_GRACE)
            .run_captured(request.max_output)?;

        if !result.timed_out
            && result.exit_code == KILLED_EXIT_CODE
            && started.elapsed() >= Duration::from_secs(secs)
        {
            result.timed_out = true;
            result.exit_code = TIMEOUT_EXIT_CODE;
        }
        debug!(container = %handle.name, exit_code = result.exit_code, timed_out = result.timed_out, "container:exec");
        Ok(result)
    }

    fn is_alive(&self, handle: &EnvironmentHandle) -> Result<bool> {
        let output = Cmd::new(self.binary())
            .args(["inspect", "--format", "{{json .State}}", handle.name.as_str()])
            .timeout(CONTROL_TIMEOUT)
            .output()?;
        if !output.status.success() {
            // No such container
            return Ok(false);
        }
        let state: ContainerState = serde_json::from_slice(&output.stdout)
            .context("Failed to parse container state")?;
        Ok(state.running)
    }

    fn remove(&self, handle: &EnvironmentHandle) -> Result<()> {
        Cmd::new(self.binary())
            .args(["rm", "-f", handle.name.as_str()])
            .timeout(CONTROL_TIMEOUT)
            .run()
            .with_context(|| format!("Failed to remove container '{}'", handle.name))?;
        info!(container = %handle.name, "container:removed");
        Ok(())
    }

    fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<FileContent> {
        let output = self.script(handle, READ_SCRIPT, &[path]).output()?;
        match output.status.code() {
            Some(0) => Ok(FileContent::Bytes(output.stdout)),
            Some(NOT_FOUND_EXIT) => Ok(FileContent::NotFound),
            Some(IS_DIR_EXIT) => Ok(FileContent::IsDirectory),
            _ => bail!(
                "Failed to read {}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    fn write_file(&self, handle: &EnvironmentHandle, path: &str, content: &[u8]) -> Result<()> {
        Cmd::new(self.binary())
            .args(self.exec_args(handle, false, true))
            .args(["sh", "-c", WRITE_SCRIPT, "sh", path])
            .stdin(content)
            .timeout(FILE_OP_TIMEOUT)
            .run()
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    fn stat(&self, handle: &EnvironmentHandle, path: &str) -> Result<Option<EntryInfo>> {
        let output = self.script(handle, STAT_SCRIPT, &[path]).output()?;
        match output.status.code() {
            Some(0) => Ok(Self::parse_entries(&output.stdout).into_iter().next()),
            Some(NOT_FOUND_EXIT) => Ok(None),
            _ => bail!(
                "Failed to stat {}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    fn list_dir(&self, handle: &EnvironmentHandle, path: &str) -> Result<Vec<EntryInfo>> {
        let output = self.script(handle, LIST_SCRIPT, &[path]).run()?;
        Ok(Self::parse_entries(&output.stdout))
    }

    fn walk(&self, handle: &EnvironmentHandle, root: &str) -> Result<Vec<EntryInfo>> {
        let output = self.script(handle, WALK_SCRIPT, &[root]).run()?;
        Ok(Self::parse_entries(&output.stdout))
    }

    fn search(
        &self,
        handle: &EnvironmentHandle,
        pattern: &str,
        root: &str,
    ) -> Result<Option<Vec<RawMatch>>> {
        let mut args: Vec<&str> = RG_ARGS.to_vec();
        args.extend(["-e", pattern, "--", root]);
        let output = self.script(handle, SEARCH_SCRIPT, &args).output()?;
        match output.status.code() {
            Some(NO_TOOL_EXIT) => {
                debug!(container = %handle.name, "container:rg unavailable, scanning files");
                Ok(None)
            }
            Some(0) | Some(1) => Ok(Some(parse_rg_output(&output.stdout))),
            _ if !output.stdout.is_empty() => Ok(Some(parse_rg_output(&output.stdout))),
            _ => Err(anyhow!(
                "rg failed in '{}': {}",
                handle.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VolumeMount;
    use crate::types::RuntimeConfig;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            name: "user-1-ab12cd34".to_string(),
            runtime: RuntimeConfig::default().with_env("MPLBACKEND", "Agg"),
            volumes: vec![VolumeMount::new("/srv/ws/user-1/workspace", "/workspace")],
            setup_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn run_args_mount_volumes_and_env() {
        let engine = ContainerEngine::new(ContainerRuntime::Docker, false);
        let args = engine.run_args(&spec());
        assert_eq!(&args[..5], &["run", "-d", "--init", "--name", "user-1-ab12cd34"]);
        assert!(args.windows(2).any(|w| w == ["--env", "MPLBACKEND=Agg"]));
        assert!(args.windows(2).any(|w| w
            == [
                "--mount",
                "type=bind,source=/srv/ws/user-1/workspace,target=/workspace"
            ]));
        assert!(!args.contains(&"--user".to_string()));
        assert_eq!(
            &args[args.len() - 3..],
            &["python:3.12-slim", "sleep", "infinity"]
        );
    }

    #[test]
    fn run_args_can_use_host_user() {
        let engine = ContainerEngine::new(ContainerRuntime::Podman, true);
        let args = engine.run_args(&spec());
        let pos = args.iter().position(|a| a == "--user").unwrap();
        assert!(args[pos + 1].contains(':'));
        assert_eq!(engine.binary(), "podman");
    }

    #[test]
    fn setup_execs_as_root_only_when_needed() {
        let engine = ContainerEngine::new(ContainerRuntime::Docker, true);
        let handle = EnvironmentHandle {
            name: "c".to_string(),
            spec: spec(),
            root: None,
        };
        let setup = engine.exec_args(&handle, true, false);
        assert!(setup.windows(2).any(|w| w == ["--user", "0"]));
        let normal = engine.exec_args(&handle, false, true);
        assert_eq!(normal, vec!["exec", "-i", "--workdir", "/workspace", "c"]);
    }

    #[test]
    fn parses_find_records() {
        let stdout = b"d\t4096\t/workspace/src\0f\t12\t/workspace/a b.py\0";
        let entries = ContainerEngine::parse_entries(stdout);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[1].path, "/workspace/a b.py");
        assert_eq!(entries[1].size, 12);
    }

    #[test]
    fn container_state_json() {
        let state: ContainerState =
            serde_json::from_str(r#"{"Status":"running","Running":true,"Pid":42}"#).unwrap();
        assert!(state.running);
    }

    #[test]
    #[ignore = "requires a docker daemon"]
    fn docker_round_trip() {
        let engine = ContainerEngine::new(ContainerRuntime::Docker, false);
        let mut spec = spec();
        spec.volumes.clear();
        spec.runtime.base_image = "alpine:3".to_string();
        spec.runtime.packages.clear();
        let handle = engine.create(&spec).unwrap();
        assert!(engine.is_alive(&handle).unwrap());

        engine
            .write_file(&handle, "/workspace/x.txt", b"it's \"quoted\"\n")
            .unwrap();
        assert_eq!(
            engine.read_file(&handle, "/workspace/x.txt").unwrap(),
            FileContent::Bytes(b"it's \"quoted\"\n".to_vec())
        );

        let result = engine
            .exec(
                &handle,
                &ExecRequest {
                    command: "sleep 10",
                    timeout: Duration::from_secs(1),
                    max_output: 1024,
                },
            )
            .unwrap();
        assert!(result.timed_out);

        engine.remove(&handle).unwrap();
        assert!(!engine.is_alive(&handle).unwrap());
    }
}
