//! Data types shared by sandbox backends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_WORK_DIR: &str = "/workspace";
pub const DEFAULT_SHELL: &str = "sh";

/// Package manager used to install [`RuntimeConfig::packages`] at start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Pip,
    Npm,
    Apt,
    None,
}

impl PackageManager {
    /// Install commands as argv lists, run in order.
    pub fn install_commands(&self, packages: &[String]) -> Vec<Vec<String>> {
        if packages.is_empty() {
            return Vec::new();
        }
        let with_packages = |base: &[&str]| {
            base.iter()
                .map(|s| s.to_string())
                .chain(packages.iter().cloned())
                .collect::<Vec<_>>()
        };
        match self {
            PackageManager::Pip => vec![with_packages(&["pip", "install", "--no-cache-dir"])],
            PackageManager::Npm => vec![with_packages(&["npm", "install", "-g"])],
            PackageManager::Apt => vec![
                vec!["apt-get".to_string(), "update".to_string()],
                with_packages(&["apt-get", "install", "-y", "--no-install-recommends"]),
            ],
            PackageManager::None => Vec::new(),
        }
    }
}

/// Declarative description of a sandbox's environment. Read only at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_image")]
    pub base_image: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub package_manager: PackageManager,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Extra shell commands run once after packages are installed.
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_work_dir() -> String {
    DEFAULT_WORK_DIR.to_string()
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_image: default_image(),
            packages: Vec::new(),
            package_manager: PackageManager::default(),
            env_vars: BTreeMap::new(),
            work_dir: default_work_dir(),
            shell: default_shell(),
            setup_commands: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.base_image = image.into();
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

/// One directory entry as reported by `ls` and `glob`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// File size in bytes; `None` for directories.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

/// Outcome of a command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    /// Combined stdout/stderr text, cut at the output cap.
    pub output: String,
    pub exit_code: i32,
    pub truncated: bool,
    /// Set when the command hit its deadline and was killed.
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecuteResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub path: String,
    pub occurrences: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.base_image, "python:3.12-slim");
        assert_eq!(runtime.work_dir, "/workspace");
        assert_eq!(runtime.shell, "sh");
        assert!(runtime.packages.is_empty());
    }

    #[test]
    fn runtime_config_from_yaml_fills_defaults() {
        let yaml = "name: datascience\npackages: [pandas, numpy]\nenv_vars:\n  MPLBACKEND: Agg\n";
        let runtime: RuntimeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(runtime.name, "datascience");
        assert_eq!(runtime.packages, vec!["pandas", "numpy"]);
        assert_eq!(runtime.env_vars.get("MPLBACKEND").map(String::as_str), Some("Agg"));
        assert_eq!(runtime.work_dir, "/workspace");
        assert_eq!(runtime.package_manager, PackageManager::Pip);
    }

    #[test]
    fn pip_install_command_preserves_package_order() {
        let cmds = PackageManager::Pip.install_commands(&["b".to_string(), "a".to_string()]);
        assert_eq!(cmds, vec![vec!["pip", "install", "--no-cache-dir", "b", "a"]]);
    }

    #[test]
    fn apt_updates_before_install() {
        let cmds = PackageManager::Apt.install_commands(&["ripgrep".to_string()]);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], vec!["apt-get", "update"]);
        assert_eq!(cmds[1].last().map(String::as_str), Some("ripgrep"));
    }

    #[test]
    fn no_packages_means_no_install() {
        assert!(PackageManager::Npm.install_commands(&[]).is_empty());
        assert!(PackageManager::None.install_commands(&["x".to_string()]).is_empty());
    }

    #[test]
    fn timed_out_result_is_not_success() {
        let result = ExecuteResult {
            output: String::new(),
            exit_code: 0,
            truncated: false,
            timed_out: true,
        };
        assert!(!result.success());
    }
}
