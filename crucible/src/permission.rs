//! Permission Arbiter: given a tool, a step, and a session, decides whether
//! the call may proceed, must be denied, or needs a user prompt.
//!
//! Generalizes the shape of a policy `check` function that returns one of a
//! small closed set of decisions — here [`Decision`] in place of a
//! transaction-specific allow/deny/require-approval call — onto tool-name
//! and session-scoped checks instead of blockchain transactions. Decisions
//! for `Prompt` can be cached per `(session, tool)` so a user is not asked
//! about the same tool twice in a session, and every decision is appended to
//! an in-memory audit log.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::tool::{Permission, RiskLevel};

/// The Permission Arbiter's decision for a single `(session, tool)` check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// The call may proceed.
    Granted,
    /// The call is refused, with a reason.
    Denied(String),
    /// A human must be asked before the call proceeds.
    Prompt,
}

/// The inputs the arbiter needs to evaluate its five ordered rules. Mirrors
/// the per-plan configuration and per-tool risk data the spec's rule order
/// references, rather than baking plan structure into this module.
#[derive(Debug, Clone, Copy)]
pub struct PermissionCheckInput<'a> {
    /// Session the check is for.
    pub session_id: &'a str,
    /// Tool being checked.
    pub tool_id: &'a str,
    /// Risk level declared on the tool.
    pub risk_level: RiskLevel,
    /// Permissions the tool declares it needs.
    pub permissions: &'a HashSet<Permission>,
    /// Whether the owning plan was created with `auto_approve`.
    pub auto_approve: bool,
    /// The owning plan's `require_approval` set of tool ids.
    pub require_approval: &'a HashSet<String>,
}

/// A single append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix-epoch milliseconds the decision was made.
    pub timestamp: u64,
    /// Tool the decision covers.
    pub tool_id: String,
    /// Risk level that was evaluated.
    pub risk_level: RiskLevel,
    /// The resulting decision.
    pub outcome: Decision,
    /// Which rule produced the outcome, for debugging/audit review.
    pub reason: String,
}

/// Evaluates permission checks and remembers `Prompt` resolutions per session.
#[derive(Default)]
pub struct PermissionArbiter {
    cache: Mutex<HashMap<(String, String), Decision>>,
    audit_log: Mutex<Vec<AuditEntry>>,
}

const PROMPT_PERMISSIONS: &[&str] = &["admin", "execute", "network"];

impl PermissionArbiter {
    /// An arbiter with an empty cache and audit log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the five ordered rules against `input`, returning the
    /// resulting [`Decision`] and appending an audit entry.
    pub fn check(&self, input: PermissionCheckInput<'_>, now: u64) -> Decision {
        let (decision, reason) = self.evaluate(input);

        tracing::info!(
            session_id = %input.session_id,
            tool_id = %input.tool_id,
            outcome = ?decision,
            reason,
            "permission decision",
        );

        self.audit_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(AuditEntry {
                timestamp: now,
                tool_id: input.tool_id.to_string(),
                risk_level: input.risk_level,
                outcome: decision.clone(),
                reason: reason.to_string(),
            });

        decision
    }

    fn evaluate(&self, input: PermissionCheckInput<'_>) -> (Decision, &'static str) {
        // Rule 1: auto-approve covers Safe/Low risk tools.
        if input.auto_approve && matches!(input.risk_level, RiskLevel::Safe | RiskLevel::Low) {
            return (Decision::Granted, "auto_approve_low_risk");
        }

        // Rule 2: a cached decision for this (session, tool) wins.
        let key = (input.session_id.to_string(), input.tool_id.to_string());
        if let Some(cached) = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&key) {
            return (cached.clone(), "cached_decision");
        }

        // Rule 3: plan explicitly requires approval for this tool.
        if input.require_approval.contains(input.tool_id) {
            return (Decision::Prompt, "plan_requires_approval");
        }

        // Rule 4: elevated permissions always prompt unless auto-approved above.
        if input
            .permissions
            .iter()
            .any(|p| PROMPT_PERMISSIONS.contains(&p.as_str()))
        {
            return (Decision::Prompt, "elevated_permission");
        }

        // Rule 5: default grant.
        (Decision::Granted, "default_grant")
    }

    /// Cache a resolved decision for `(session_id, tool_id)`, typically the
    /// user's answer to a `Prompt`.
    pub fn record_decision(&self, session_id: &str, tool_id: &str, decision: Decision) {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((session_id.to_string(), tool_id.to_string()), decision);
    }

    /// A copy of the audit log accumulated so far.
    #[must_use]
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for PermissionArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionArbiter")
            .field("audit_entries", &self.audit_log().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(
        permissions: &'a HashSet<Permission>,
        require_approval: &'a HashSet<String>,
        risk_level: RiskLevel,
        auto_approve: bool,
    ) -> PermissionCheckInput<'a> {
        PermissionCheckInput {
            session_id: "s1",
            tool_id: "read_file",
            risk_level,
            permissions,
            auto_approve,
            require_approval,
        }
    }

    #[test]
    fn auto_approve_grants_safe_tools() {
        let arbiter = PermissionArbiter::new();
        let perms = HashSet::new();
        let require = HashSet::new();
        let decision = arbiter.check(input(&perms, &require, RiskLevel::Safe, true), 0);
        assert_eq!(decision, Decision::Granted);
    }

    #[test]
    fn require_approval_set_prompts_even_when_auto_approve_false() {
        let arbiter = PermissionArbiter::new();
        let perms = HashSet::new();
        let mut require = HashSet::new();
        require.insert("read_file".to_string());
        let decision = arbiter.check(input(&perms, &require, RiskLevel::Safe, false), 0);
        assert_eq!(decision, Decision::Prompt);
    }

    #[test]
    fn elevated_permission_prompts() {
        let arbiter = PermissionArbiter::new();
        let mut perms = HashSet::new();
        perms.insert(Permission::new("network"));
        let require = HashSet::new();
        let decision = arbiter.check(input(&perms, &require, RiskLevel::Medium, false), 0);
        assert_eq!(decision, Decision::Prompt);
    }

    #[test]
    fn cached_decision_short_circuits_later_checks() {
        let arbiter = PermissionArbiter::new();
        arbiter.record_decision("s1", "read_file", Decision::Denied("user said no".into()));
        let perms = HashSet::new();
        let require = HashSet::new();
        let decision = arbiter.check(input(&perms, &require, RiskLevel::Safe, true), 0);
        assert_eq!(decision, Decision::Denied("user said no".into()));
    }

    #[test]
    fn default_case_grants() {
        let arbiter = PermissionArbiter::new();
        let perms = HashSet::new();
        let require = HashSet::new();
        let decision = arbiter.check(input(&perms, &require, RiskLevel::Medium, false), 0);
        assert_eq!(decision, Decision::Granted);
        assert_eq!(arbiter.audit_log().len(), 1);
    }
}
