//! Ready-made rulesets and a builder for common custom ones.

use serde::{Deserialize, Serialize};

use super::types::{Action, Operation, OperationPermissions, PermissionRule, PermissionRuleset};

/// Files that commonly hold credentials or keys.
pub const SECRETS_PATTERNS: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/*.pem",
    "**/*.key",
    "**/*.crt",
    "**/credentials*",
    "**/secrets*",
    "**/*secret*",
    "**/*password*",
    "**/.aws/**",
    "**/.ssh/**",
    "**/.gnupg/**",
];

/// System directories that should not be modified.
pub const SYSTEM_PATTERNS: &[&str] = &[
    "/etc/**", "/var/**", "/usr/**", "/bin/**", "/sbin/**", "/boot/**", "/sys/**", "/proc/**",
];

pub const DANGEROUS_COMMANDS: &[&str] = &[
    "rm -rf /*",
    "rm -rf /",
    ":(){:|:&};:",
    "dd if=*of=/dev/*",
    "mkfs*",
    "> /dev/sda",
    "chmod -R 777 /",
];

const SECRETS_REASON: &str = "Protect sensitive files";
const SYSTEM_REASON: &str = "Protect sensitive and system files";
const COMMAND_REASON: &str = "Block dangerous commands";

fn deny_rules<'a>(patterns: impl IntoIterator<Item = &'a &'a str>, reason: &str) -> Vec<PermissionRule> {
    patterns
        .into_iter()
        .map(|p| PermissionRule::new(*p, Action::Deny).describe(reason))
        .collect()
}

fn secrets() -> Vec<PermissionRule> {
    deny_rules(SECRETS_PATTERNS, SECRETS_REASON)
}

fn secrets_and_system() -> Vec<PermissionRule> {
    deny_rules(SECRETS_PATTERNS.iter().chain(SYSTEM_PATTERNS), SYSTEM_REASON)
}

fn dangerous_commands() -> Vec<PermissionRule> {
    deny_rules(DANGEROUS_COMMANDS, COMMAND_REASON)
}

fn perms(default: Action, rules: Vec<PermissionRule>) -> OperationPermissions {
    OperationPermissions::new(default).with_rules(rules)
}

/// Reads allowed except secrets; writes, edits and commands need approval.
pub fn default_ruleset() -> PermissionRuleset {
    PermissionRuleset::with_default(Action::Ask)
        .set(Operation::Read, perms(Action::Allow, secrets()))
        .set(Operation::Write, perms(Action::Ask, secrets()))
        .set(Operation::Edit, perms(Action::Ask, secrets()))
        .set(Operation::Execute, perms(Action::Ask, dangerous_commands()))
        .set(Operation::Glob, OperationPermissions::new(Action::Allow))
        .set(Operation::Grep, OperationPermissions::new(Action::Allow))
        .set(Operation::Ls, OperationPermissions::new(Action::Allow))
}

/// Everything allowed except secrets, system paths and dangerous commands.
pub fn permissive_ruleset() -> PermissionRuleset {
    PermissionRuleset::with_default(Action::Allow)
        .set(Operation::Read, perms(Action::Allow, secrets()))
        .set(Operation::Write, perms(Action::Allow, secrets_and_system()))
        .set(Operation::Edit, perms(Action::Allow, secrets_and_system()))
        .set(Operation::Execute, perms(Action::Allow, dangerous_commands()))
        .set(Operation::Glob, OperationPermissions::new(Action::Allow))
        .set(Operation::Grep, OperationPermissions::new(Action::Allow))
        .set(Operation::Ls, OperationPermissions::new(Action::Allow))
}

/// Inspection only: no writes, edits or commands.
pub fn readonly_ruleset() -> PermissionRuleset {
    PermissionRuleset::with_default(Action::Deny)
        .set(Operation::Read, perms(Action::Allow, secrets()))
        .set(Operation::Write, OperationPermissions::new(Action::Deny))
        .set(Operation::Edit, OperationPermissions::new(Action::Deny))
        .set(Operation::Execute, OperationPermissions::new(Action::Deny))
        .set(Operation::Glob, OperationPermissions::new(Action::Allow))
        .set(Operation::Grep, OperationPermissions::new(Action::Allow))
        .set(Operation::Ls, OperationPermissions::new(Action::Allow))
}

/// Every operation needs approval; secrets and dangerous commands are denied.
pub fn strict_ruleset() -> PermissionRuleset {
    PermissionRuleset::with_default(Action::Ask)
        .set(Operation::Read, perms(Action::Ask, secrets()))
        .set(Operation::Write, perms(Action::Ask, secrets()))
        .set(Operation::Edit, perms(Action::Ask, secrets()))
        .set(Operation::Execute, perms(Action::Ask, dangerous_commands()))
        .set(Operation::Glob, OperationPermissions::new(Action::Ask))
        .set(Operation::Grep, OperationPermissions::new(Action::Ask))
        .set(Operation::Ls, OperationPermissions::new(Action::Ask))
}

/// Named presets selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Default,
    Permissive,
    Readonly,
    Strict,
}

impl Preset {
    pub fn ruleset(&self) -> PermissionRuleset {
        match self {
            Preset::Default => default_ruleset(),
            Preset::Permissive => permissive_ruleset(),
            Preset::Readonly => readonly_ruleset(),
            Preset::Strict => strict_ruleset(),
        }
    }
}

/// Builder for rulesets that allow some operations outright and ask for the rest.
#[derive(Debug, Clone)]
pub struct RulesetBuilder {
    default: Action,
    allowed: [bool; 7],
    deny_secrets: bool,
}

impl Default for RulesetBuilder {
    fn default() -> Self {
        Self {
            default: Action::Ask,
            // read, write, edit, execute, glob, grep, ls
            allowed: [true, false, false, false, true, true, true],
            deny_secrets: true,
        }
    }
}

impl RulesetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_action(mut self, action: Action) -> Self {
        self.default = action;
        self
    }

    pub fn allow(mut self, operation: Operation, allowed: bool) -> Self {
        self.allowed[index(operation)] = allowed;
        self
    }

    pub fn deny_secrets(mut self, deny: bool) -> Self {
        self.deny_secrets = deny;
        self
    }

    pub fn build(self) -> PermissionRuleset {
        let mut ruleset = PermissionRuleset::with_default(self.default);
        for operation in Operation::ALL {
            let action = if self.allowed[index(operation)] {
                Action::Allow
            } else {
                Action::Ask
            };
            let guards_files = matches!(
                operation,
                Operation::Read | Operation::Write | Operation::Edit
            );
            let rules = if self.deny_secrets && guards_files {
                secrets()
            } else {
                Vec::new()
            };
            ruleset.set_operation(operation, perms(action, rules));
        }
        ruleset
    }
}

fn index(operation: Operation) -> usize {
    Operation::ALL
        .iter()
        .position(|op| *op == operation)
        .unwrap_or_default()
}

/// Shorthand for `RulesetBuilder::new()`.
pub fn create_ruleset() -> RulesetBuilder {
    RulesetBuilder::new()
}
