//! Rule-based approval of sandbox operations.

mod engine;
mod presets;
mod types;

pub use engine::{AskCallback, AskFallback, PermissionEngine, ask_callback};
pub use presets::{
    DANGEROUS_COMMANDS, Preset, RulesetBuilder, SECRETS_PATTERNS, SYSTEM_PATTERNS, create_ruleset,
    default_ruleset, permissive_ruleset, readonly_ruleset, strict_ruleset,
};
pub use types::{Action, Operation, OperationPermissions, PermissionRule, PermissionRuleset};
