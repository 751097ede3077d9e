use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// What a rule (or default) decides for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Ask,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Ask => "ask",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            "ask" => Ok(Action::Ask),
            other => Err(Error::Config(format!(
                "unknown permission action '{}' (expected allow, deny or ask)",
                other
            ))),
        }
    }
}

/// Operations gated by the permission engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Edit,
    Execute,
    Glob,
    Grep,
    Ls,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Read,
        Operation::Write,
        Operation::Edit,
        Operation::Execute,
        Operation::Glob,
        Operation::Grep,
        Operation::Ls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Edit => "edit",
            Operation::Execute => "execute",
            Operation::Glob => "glob",
            Operation::Grep => "grep",
            Operation::Ls => "ls",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pattern plus the action taken when it matches.
///
/// Rules are evaluated in order and the first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub action: Action,
    #[serde(default)]
    pub description: String,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, action: Action) -> Self {
        Self {
            pattern: pattern.into(),
            action,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPermissions {
    #[serde(default = "default_operation_action")]
    pub default: Action,
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
}

fn default_operation_action() -> Action {
    Action::Allow
}

impl Default for OperationPermissions {
    fn default() -> Self {
        Self {
            default: default_operation_action(),
            rules: Vec::new(),
        }
    }
}

impl OperationPermissions {
    pub fn new(default: Action) -> Self {
        Self {
            default,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<PermissionRule>) -> Self {
        self.rules = rules;
        self
    }
}

/// Complete policy: a global default plus optional per-operation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRuleset {
    #[serde(default = "default_global_action")]
    pub default: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<OperationPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<OperationPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<OperationPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<OperationPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<OperationPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grep: Option<OperationPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ls: Option<OperationPermissions>,
}

fn default_global_action() -> Action {
    Action::Ask
}

impl Default for PermissionRuleset {
    fn default() -> Self {
        Self::with_default(default_global_action())
    }
}

impl PermissionRuleset {
    pub fn with_default(default: Action) -> Self {
        Self {
            default,
            read: None,
            write: None,
            edit: None,
            execute: None,
            glob: None,
            grep: None,
            ls: None,
        }
    }

    /// Configured permissions for `operation`, if any.
    pub fn operation(&self, operation: Operation) -> Option<&OperationPermissions> {
        match operation {
            Operation::Read => self.read.as_ref(),
            Operation::Write => self.write.as_ref(),
            Operation::Edit => self.edit.as_ref(),
            Operation::Execute => self.execute.as_ref(),
            Operation::Glob => self.glob.as_ref(),
            Operation::Grep => self.grep.as_ref(),
            Operation::Ls => self.ls.as_ref(),
        }
    }

    pub fn set_operation(&mut self, operation: Operation, permissions: OperationPermissions) {
        let slot = match operation {
            Operation::Read => &mut self.read,
            Operation::Write => &mut self.write,
            Operation::Edit => &mut self.edit,
            Operation::Execute => &mut self.execute,
            Operation::Glob => &mut self.glob,
            Operation::Grep => &mut self.grep,
            Operation::Ls => &mut self.ls,
        };
        *slot = Some(permissions);
    }

    pub fn set(mut self, operation: Operation, permissions: OperationPermissions) -> Self {
        self.set_operation(operation, permissions);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parses_known_values() {
        assert_eq!("allow".parse::<Action>().unwrap(), Action::Allow);
        assert_eq!("deny".parse::<Action>().unwrap(), Action::Deny);
        assert_eq!("ask".parse::<Action>().unwrap(), Action::Ask);
    }

    #[test]
    fn unknown_action_is_config_error() {
        let err = "maybe".parse::<Action>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let yaml = "default: maybe\n";
        assert!(serde_yaml::from_str::<PermissionRuleset>(yaml).is_err());
    }

    #[test]
    fn ruleset_defaults_to_ask() {
        let ruleset = PermissionRuleset::default();
        assert_eq!(ruleset.default, Action::Ask);
        assert!(ruleset.operation(Operation::Read).is_none());
    }

    #[test]
    fn ruleset_from_yaml_preserves_rule_order() {
        let yaml = r#"
default: deny
write:
  default: ask
  rules:
    - pattern: "**/tmp/**"
      action: allow
    - pattern: "**/*.lock"
      action: deny
      description: Lock files are generated
"#;
        let ruleset: PermissionRuleset = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ruleset.default, Action::Deny);
        let write = ruleset.operation(Operation::Write).unwrap();
        assert_eq!(write.default, Action::Ask);
        assert_eq!(write.rules[0].pattern, "**/tmp/**");
        assert_eq!(write.rules[1].action, Action::Deny);
        assert_eq!(write.rules[1].description, "Lock files are generated");
    }

    #[test]
    fn operation_permissions_default_to_allow() {
        let yaml = "rules: []\n";
        let perms: OperationPermissions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(perms.default, Action::Allow);
    }

    #[test]
    fn set_operation_replaces_slot() {
        let ruleset = PermissionRuleset::with_default(Action::Deny)
            .set(Operation::Ls, OperationPermissions::new(Action::Allow));
        assert_eq!(
            ruleset.operation(Operation::Ls).map(|p| p.default),
            Some(Action::Allow)
        );
        assert!(ruleset.operation(Operation::Grep).is_none());
    }
}
