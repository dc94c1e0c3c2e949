//! Ordered allow/deny rule evaluation for (from, to) subject pairs.
//!
//! The bus is embedded in a single process where rule authors are the
//! system itself, so the default is allow: deny rules are opt-in
//! guardrails (e.g. cross-namespace deny at priority 10, same-namespace
//! allow at priority 100, explicit cross-namespace allow at priority 50).

use std::sync::RwLock;

use relay_types::{AccessAction, AccessRule};

/// Outcome of an access check.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub matched_rule: Option<AccessRule>,
}

/// Holds the current rule set and evaluates `check` against it. Rules are
/// deduplicated by `(from, to)`; re-adding the same key replaces the rule.
pub struct AccessController {
    rules: RwLock<Vec<AccessRule>>,
}

impl Default for AccessController {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessController {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace a rule, keyed on `(from, to)`.
    pub fn add_rule(&self, rule: AccessRule) {
        let mut rules = self.rules.write().expect("access rules lock poisoned");
        if let Some(existing) = rules
            .iter_mut()
            .find(|r| r.from == rule.from && r.to == rule.to)
        {
            *existing = rule;
        } else {
            rules.push(rule);
        }
    }

    /// Returns whether a matching rule was actually removed.
    pub fn remove_rule(&self, from: &str, to: &str) -> bool {
        let mut rules = self.rules.write().expect("access rules lock poisoned");
        let before = rules.len();
        rules.retain(|r| !(r.from == from && r.to == to));
        before != rules.len()
    }

    pub fn list_rules(&self) -> Vec<AccessRule> {
        self.rules.read().expect("access rules lock poisoned").clone()
    }

    /// Evaluate rules in priority-descending order; first pattern match on
    /// both `from` and `to` wins. Empty or fully-unmatched rule set is
    /// allow-by-default.
    pub fn check(&self, from_subject: &str, to_subject: &str) -> AccessDecision {
        let rules = self.rules.read().expect("access rules lock poisoned");
        let mut sorted: Vec<&AccessRule> = rules.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in sorted {
            if relay_subject::matches(&rule.from, from_subject)
                && relay_subject::matches(&rule.to, to_subject)
            {
                return AccessDecision {
                    allowed: rule.action == AccessAction::Allow,
                    matched_rule: Some(rule.clone()),
                };
            }
        }

        AccessDecision {
            allowed: true,
            matched_rule: None,
        }
    }
}
