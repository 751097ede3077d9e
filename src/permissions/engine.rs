use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{Action, Operation, PermissionRule, PermissionRuleset};
use crate::error::{Error, Result};
use crate::pattern::PatternMatcher;

/// Approval hook invoked for `ask` decisions with `(operation, target, reason)`.
/// Resolving to `true` allows the operation.
pub type AskCallback =
    Arc<dyn Fn(Operation, String, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Build an [`AskCallback`] from an async closure.
pub fn ask_callback<F, Fut>(f: F) -> AskCallback
where
    F: Fn(Operation, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |operation, target, reason| Box::pin(f(operation, target, reason)))
}

/// What to do with an `ask` decision when no callback is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskFallback {
    Deny,
    #[default]
    Error,
}

struct CompiledRule {
    matcher: PatternMatcher,
    rule: PermissionRule,
}

struct CompiledOperation {
    default: Action,
    rules: Vec<CompiledRule>,
}

/// Evaluates a [`PermissionRuleset`] against operations and targets.
///
/// Patterns are compiled once in [`PermissionEngine::new`]; evaluation is a
/// pure function of the ruleset and the target.
pub struct PermissionEngine {
    ruleset: PermissionRuleset,
    compiled: HashMap<Operation, CompiledOperation>,
    ask_callback: Option<AskCallback>,
    ask_fallback: AskFallback,
}

impl fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("ruleset", &self.ruleset)
            .field("has_ask_callback", &self.ask_callback.is_some())
            .field("ask_fallback", &self.ask_fallback)
            .finish()
    }
}

/// An engine over [`PermissionRuleset::default`]: every operation asks.
impl Default for PermissionEngine {
    fn default() -> Self {
        Self {
            ruleset: PermissionRuleset::default(),
            compiled: HashMap::new(),
            ask_callback: None,
            ask_fallback: AskFallback::default(),
        }
    }
}

impl PermissionEngine {
    pub fn new(ruleset: PermissionRuleset) -> Result<Self> {
        let mut compiled = HashMap::new();
        for operation in Operation::ALL {
            let Some(perms) = ruleset.operation(operation) else {
                continue;
            };
            let rules = perms
                .rules
                .iter()
                .map(|rule| {
                    Ok(CompiledRule {
                        matcher: PatternMatcher::new(&rule.pattern)?,
                        rule: rule.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            compiled.insert(
                operation,
                CompiledOperation {
                    default: perms.default,
                    rules,
                },
            );
        }

        Ok(Self {
            ruleset,
            compiled,
            ask_callback: None,
            ask_fallback: AskFallback::default(),
        })
    }

    pub fn with_ask_callback(mut self, callback: AskCallback) -> Self {
        self.ask_callback = Some(callback);
        self
    }

    pub fn with_ask_fallback(mut self, fallback: AskFallback) -> Self {
        self.ask_fallback = fallback;
        self
    }

    pub fn ruleset(&self) -> &PermissionRuleset {
        &self.ruleset
    }

    pub fn ask_fallback(&self) -> AskFallback {
        self.ask_fallback
    }

    /// Resolve the configured action, `ask` included.
    ///
    /// Falls back to the global default when the operation has no settings,
    /// then scans rules in order (first match wins), then uses the
    /// operation's default.
    pub fn evaluate(&self, operation: Operation, target: &str) -> Action {
        let Some(op) = self.compiled.get(&operation) else {
            return self.ruleset.default;
        };
        op.rules
            .iter()
            .find(|r| r.matcher.is_match(target))
            .map(|r| r.rule.action)
            .unwrap_or(op.default)
    }

    /// The first rule whose pattern matches `target`.
    pub fn matching_rule(&self, operation: Operation, target: &str) -> Option<&PermissionRule> {
        self.compiled
            .get(&operation)?
            .rules
            .iter()
            .find(|r| r.matcher.is_match(target))
            .map(|r| &r.rule)
    }

    /// Rule evaluation without callbacks. `ask` resolves to `deny`.
    pub fn check_sync(&self, operation: Operation, target: &str) -> Action {
        match self.evaluate(operation, target) {
            Action::Ask => Action::Deny,
            action => action,
        }
    }

    pub fn is_allowed(&self, operation: Operation, target: &str) -> bool {
        self.check_sync(operation, target) == Action::Allow
    }

    pub fn is_denied(&self, operation: Operation, target: &str) -> bool {
        self.check_sync(operation, target) == Action::Deny
    }

    /// Whether the operation would need approval before it could proceed.
    pub fn requires_approval(&self, operation: Operation, target: &str) -> bool {
        self.evaluate(operation, target) == Action::Ask
    }

    /// Resolve to `allow` or `deny`, consulting the approval callback on `ask`.
    ///
    /// Without a callback the fallback applies: `deny`, or
    /// [`Error::PermissionAskUnavailable`] for [`AskFallback::Error`].
    pub async fn check(&self, operation: Operation, target: &str, reason: &str) -> Result<Action> {
        match self.evaluate(operation, target) {
            Action::Ask => {}
            action => return Ok(action),
        }

        match &self.ask_callback {
            Some(callback) => {
                debug!(%operation, subject = target, "permission:ask");
                let approved = callback(operation, target.to_string(), reason.to_string()).await;
                debug!(%operation, subject = target, approved, "permission:answer");
                Ok(if approved { Action::Allow } else { Action::Deny })
            }
            None => match self.ask_fallback {
                AskFallback::Deny => Ok(Action::Deny),
                AskFallback::Error => Err(Error::PermissionAskUnavailable {
                    operation,
                    target: target.to_string(),
                    reason: non_empty(reason),
                }),
            },
        }
    }

    /// Like [`check`](Self::check) but turns `deny` into an error and gives
    /// up with [`Error::Cancelled`] as soon as `cancel` fires.
    pub async fn authorize(
        &self,
        operation: Operation,
        target: &str,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let action = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%operation, subject = target, "permission:cancelled");
                return Err(Error::Cancelled);
            }
            action = self.check(operation, target, reason) => action?,
        };

        match action {
            Action::Allow => Ok(()),
            _ => Err(self.denied(operation, target)),
        }
    }

    /// Synchronous enforcement for callers that cannot wait on approval.
    pub fn enforce_sync(&self, operation: Operation, target: &str) -> Result<()> {
        match self.evaluate(operation, target) {
            Action::Allow => Ok(()),
            Action::Deny => Err(self.denied(operation, target)),
            Action::Ask => match self.ask_fallback {
                AskFallback::Deny => Err(Error::PermissionDenied {
                    operation,
                    target: target.to_string(),
                    reason: Some("approval required".to_string()),
                }),
                AskFallback::Error => Err(Error::PermissionAskUnavailable {
                    operation,
                    target: target.to_string(),
                    reason: Some("approval required but no callback".to_string()),
                }),
            },
        }
    }

    fn denied(&self, operation: Operation, target: &str) -> Error {
        let reason = self
            .matching_rule(operation, target)
            .filter(|rule| rule.action == Action::Deny)
            .and_then(|rule| non_empty(&rule.description));
        debug!(%operation, subject = target, ?reason, "permission:denied");
        Error::PermissionDenied {
            operation,
            target: target.to_string(),
            reason,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
