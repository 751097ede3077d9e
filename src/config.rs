use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::{self, Engine};
use crate::error::{Error, Result};
use crate::permissions::{AskFallback, PermissionEngine, PermissionRuleset, Preset};
use crate::sandbox::SandboxOptions;
use crate::session::{CleanupLoop, SessionManager, SessionOptions};
use crate::types::RuntimeConfig;

/// Environment variable naming an explicit global config file.
pub const CONFIG_ENV_VAR: &str = "BOXWARDEN_CONFIG";

const PROJECT_CONFIG_NAMES: [&str; 2] = [".boxwarden.yaml", ".boxwarden.yml"];

/// Which engine provisions sandboxes.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Docker/Podman containers (default)
    #[default]
    Container,
    /// Host processes confined to a private root directory
    Process,
}

/// Container runtime for the container engine
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl ContainerRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct EngineConfig {
    /// Engine kind. Default: container
    #[serde(default)]
    pub kind: Option<EngineKind>,

    /// Container runtime (for container engine). Default: docker
    #[serde(default)]
    pub runtime: Option<ContainerRuntime>,

    /// Run containers as the host uid:gid so files in bind-mounted workspaces
    /// stay owned by the host user. Default: false
    #[serde(default)]
    pub run_as_host_user: Option<bool>,

    /// Host directory holding process-engine roots. Default: system temp dir
    #[serde(default)]
    pub process_root: Option<PathBuf>,
}

impl EngineConfig {
    pub fn kind(&self) -> EngineKind {
        self.kind.unwrap_or_default()
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime.unwrap_or_default()
    }

    pub fn run_as_host_user(&self) -> bool {
        self.run_as_host_user.unwrap_or(false)
    }

    pub fn process_root(&self) -> PathBuf {
        self.process_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("boxwarden"))
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SandboxConfig {
    /// Default command timeout in seconds. Default: 120
    #[serde(default)]
    pub exec_timeout_secs: Option<u64>,

    /// Cap on captured command output in bytes. Default: 100000
    #[serde(default)]
    pub max_output_bytes: Option<usize>,

    /// Bound on package installation and setup commands. Default: 300
    #[serde(default)]
    pub setup_timeout_secs: Option<u64>,

    /// Sandbox path prefixes file operations may touch. Empty: unrestricted
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
}

impl SandboxConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs.unwrap_or(120))
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes.unwrap_or(100_000)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs.unwrap_or(300))
    }

    pub fn allowed_paths(&self) -> Vec<String> {
        self.allowed_paths.clone().unwrap_or_default()
    }

    pub fn options(&self) -> SandboxOptions {
        SandboxOptions {
            exec_timeout: self.exec_timeout(),
            max_output_bytes: self.max_output_bytes(),
            setup_timeout: self.setup_timeout(),
            allowed_paths: self.allowed_paths(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SessionsConfig {
    /// Root for persistent per-session workspaces. Default: none (ephemeral)
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Seconds of inactivity before a session is evicted. Default: 3600
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Seconds between background idle sweeps. Default: 300
    #[serde(default)]
    pub cleanup_interval_secs: Option<u64>,
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.unwrap_or(300))
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct PermissionsConfig {
    /// Named preset. Default: default
    #[serde(default)]
    pub preset: Option<Preset>,

    /// Inline ruleset; takes precedence over `preset`.
    #[serde(default)]
    pub ruleset: Option<PermissionRuleset>,

    /// What `ask` resolves to without an approval callback. Default: error
    #[serde(default)]
    pub ask_fallback: Option<AskFallback>,
}

impl PermissionsConfig {
    pub fn ruleset(&self) -> PermissionRuleset {
        self.ruleset
            .clone()
            .unwrap_or_else(|| self.preset.unwrap_or_default().ruleset())
    }

    pub fn ask_fallback(&self) -> AskFallback {
        self.ask_fallback.unwrap_or_default()
    }

    /// Compile the configured ruleset. Malformed patterns are reported here.
    pub fn engine(&self) -> Result<PermissionEngine> {
        Ok(PermissionEngine::new(self.ruleset())?.with_ask_fallback(self.ask_fallback()))
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Environment every session sandbox is created from
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub permissions: PermissionsConfig,
}

impl Config {
    /// Load the global configuration and merge the nearest project file found
    /// from the current directory upward.
    pub fn load() -> Result<Self> {
        let start_dir = std::env::current_dir().unwrap_or_default();
        Self::load_from(None, &start_dir)
    }

    /// Load with an explicit global file (or the default lookup when `None`)
    /// and a project search starting at `start_dir`.
    pub fn load_from(global_path: Option<&Path>, start_dir: &Path) -> Result<Self> {
        debug!("config:loading");
        let global = match global_path {
            Some(path) => Some(Self::load_from_path(path)?.ok_or_else(|| {
                Error::Config(format!("config file {} does not exist", path.display()))
            })?),
            None => Self::load_global()?,
        };
        let project = match find_project_config(start_dir) {
            Some(path) => Self::load_from_path(&path)?,
            None => None,
        };

        let config = global.unwrap_or_default().merge(project.unwrap_or_default());
        debug!(
            engine = ?config.engine.kind(),
            workspace_root = ?config.sessions.workspace_root,
            "config:loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
            .map(Some)
            .map_err(|e| Error::Config(format!("Failed to parse config at {}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// The global config from `$BOXWARDEN_CONFIG` or the XDG config directory.
    fn load_global() -> Result<Option<Self>> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR)
            && !path.is_empty()
        {
            return Self::load_from_path(Path::new(&path));
        }

        let config_dir = match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => home::home_dir().map(|h| h.join(".config")),
        };
        if let Some(dir) = config_dir {
            for name in ["config.yaml", "config.yml"] {
                let path = dir.join("boxwarden").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    /// Merge a project config into a global config. Project values win; a
    /// project ruleset replaces the global one wholesale.
    fn merge(self, project: Self) -> Self {
        Config {
            engine: EngineConfig {
                kind: project.engine.kind.or(self.engine.kind),
                runtime: project.engine.runtime.or(self.engine.runtime),
                run_as_host_user: project
                    .engine
                    .run_as_host_user
                    .or(self.engine.run_as_host_user),
                process_root: project.engine.process_root.or(self.engine.process_root),
            },
            sandbox: SandboxConfig {
                exec_timeout_secs: project
                    .sandbox
                    .exec_timeout_secs
                    .or(self.sandbox.exec_timeout_secs),
                max_output_bytes: project
                    .sandbox
                    .max_output_bytes
                    .or(self.sandbox.max_output_bytes),
                setup_timeout_secs: project
                    .sandbox
                    .setup_timeout_secs
                    .or(self.sandbox.setup_timeout_secs),
                allowed_paths: project.sandbox.allowed_paths.or(self.sandbox.allowed_paths),
            },
            runtime: project.runtime.or(self.runtime),
            sessions: SessionsConfig {
                workspace_root: project
                    .sessions
                    .workspace_root
                    .or(self.sessions.workspace_root),
                idle_timeout_secs: project
                    .sessions
                    .idle_timeout_secs
                    .or(self.sessions.idle_timeout_secs),
                cleanup_interval_secs: project
                    .sessions
                    .cleanup_interval_secs
                    .or(self.sessions.cleanup_interval_secs),
            },
            permissions: PermissionsConfig {
                // An explicit project preset also displaces a global inline ruleset.
                ruleset: if project.permissions.ruleset.is_some() {
                    project.permissions.ruleset
                } else if project.permissions.preset.is_some() {
                    None
                } else {
                    self.permissions.ruleset
                },
                preset: project.permissions.preset.or(self.permissions.preset),
                ask_fallback: project
                    .permissions
                    .ask_fallback
                    .or(self.permissions.ask_fallback),
            },
        }
    }

    pub fn runtime(&self) -> RuntimeConfig {
        self.runtime.clone().unwrap_or_default()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            runtime: self.runtime(),
            workspace_root: self.sessions.workspace_root.clone(),
            idle_timeout: self.sessions.idle_timeout(),
            sandbox: self.sandbox.options(),
        }
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        engine::from_config(&self.engine)
    }

    /// A session manager wired to the configured engine and permissions.
    pub fn session_manager(&self) -> Result<SessionManager> {
        let permissions = self.permissions.engine()?;
        let engine = self.engine();
        info!(
            engine = engine.kind(),
            idle_timeout_secs = self.sessions.idle_timeout().as_secs(),
            persistent = self.sessions.workspace_root.is_some(),
            "config:session manager ready"
        );
        Ok(SessionManager::new(self.session_options(), engine)
            .with_permissions(Arc::new(permissions)))
    }

    /// Sweep idle sessions of `manager` at the configured cleanup interval.
    pub fn start_cleanup(&self, manager: &Arc<SessionManager>) -> CleanupLoop {
        manager.start_cleanup_loop(self.sessions.cleanup_interval())
    }
}

/// Find the nearest project config by walking up from `start_dir`.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    start_dir.ancestors().find_map(|dir| {
        PROJECT_CONFIG_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{Action, Operation};
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.engine.kind(), EngineKind::Container);
        assert_eq!(config.engine.runtime().binary(), "docker");
        assert_eq!(config.sandbox.exec_timeout(), Duration::from_secs(120));
        assert_eq!(config.sandbox.max_output_bytes(), 100_000);
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(3600));
        assert_eq!(config.sessions.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.runtime().base_image, "python:3.12-slim");
        assert_eq!(config.permissions.ask_fallback(), AskFallback::Error);
        assert!(config.sessions.workspace_root.is_none());
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
engine:
  kind: process
  process_root: /tmp/roots
sandbox:
  exec_timeout_secs: 30
  allowed_paths: [/workspace]
runtime:
  name: node
  base_image: node:20-slim
  package_manager: npm
  packages: [typescript]
sessions:
  workspace_root: /srv/boxwarden
  idle_timeout_secs: 60
permissions:
  preset: readonly
  ask_fallback: deny
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.engine.kind(), EngineKind::Process);
        assert_eq!(config.engine.process_root(), PathBuf::from("/tmp/roots"));
        assert_eq!(config.sandbox.exec_timeout(), Duration::from_secs(30));
        assert_eq!(config.sandbox.allowed_paths(), vec!["/workspace"]);
        assert_eq!(config.runtime().base_image, "node:20-slim");
        assert_eq!(config.runtime().work_dir, "/workspace");

        let options = config.session_options();
        assert_eq!(options.workspace_root, Some(PathBuf::from("/srv/boxwarden")));
        assert_eq!(options.idle_timeout, Duration::from_secs(60));

        let engine = config.permissions.engine().unwrap();
        assert_eq!(engine.ask_fallback(), AskFallback::Deny);
        assert_eq!(engine.evaluate(Operation::Write, "/workspace/a"), Action::Deny);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let yaml = "permissions:\n  ruleset:\n    default: sometimes\n";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn malformed_rule_pattern_fails_engine_construction() {
        let yaml = r#"
permissions:
  ruleset:
    default: ask
    read:
      rules:
        - pattern: "[unclosed"
          action: deny
"#;
        let config = Config::parse(yaml).unwrap();
        assert!(matches!(
            config.permissions.engine(),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn project_values_override_global() {
        let global = Config::parse(
            "sandbox:\n  exec_timeout_secs: 10\n  max_output_bytes: 500\npermissions:\n  ruleset:\n    default: allow\n",
        )
        .unwrap();
        let project =
            Config::parse("sandbox:\n  exec_timeout_secs: 20\npermissions:\n  preset: strict\n")
                .unwrap();

        let merged = global.merge(project);
        assert_eq!(merged.sandbox.exec_timeout(), Duration::from_secs(20));
        assert_eq!(merged.sandbox.max_output_bytes(), 500);
        assert!(merged.permissions.ruleset.is_none());
        assert_eq!(merged.permissions.ruleset().default, Action::Ask);
    }

    #[test]
    fn load_from_merges_nearest_project_file() {
        let dir = TempDir::new().unwrap();
        let global_path = dir.path().join("global.yaml");
        fs::write(&global_path, "sessions:\n  idle_timeout_secs: 10\n").unwrap();

        let project_dir = dir.path().join("project");
        let nested = project_dir.join("src/deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            project_dir.join(".boxwarden.yaml"),
            "engine:\n  kind: process\n",
        )
        .unwrap();

        let config = Config::load_from(Some(&global_path), &nested).unwrap();
        assert_eq!(config.engine.kind(), EngineKind::Process);
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn start_cleanup_uses_configured_interval() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            "engine:\n  kind: process\n  process_root: {}\nsessions:\n  idle_timeout_secs: 0\n  cleanup_interval_secs: 1\n",
            dir.path().display()
        );
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(config.sessions.cleanup_interval(), Duration::from_secs(1));

        let manager = Arc::new(config.session_manager().unwrap());
        manager.get_or_create("idle").unwrap().start().unwrap();
        let cleanup = config.start_cleanup(&manager);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.contains("idle") && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        cleanup.stop();
        assert!(!manager.contains("idle"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load_from(Some(&dir.path().join("nope.yaml")), dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "engine: [not, a, map]\n").unwrap();
        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }
}
