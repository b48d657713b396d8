//! Usage policies
//!
//! The engine treats policy evaluation as a yes/no oracle behind
//! [`PolicyEvaluator`]. [`RuleEvaluator`] is a small attribute-matching
//! implementation: constraints are `left <op> right` predicates over the
//! attributes of a [`PolicyContext`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::query::{Criterion, Operator, PropertyValue};

/// Action every rule applies to unless it names another
pub const USE_ACTION: &str = "use";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Asset the policy governs
    pub target: Option<String>,
    pub assigner: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Rule>,
    #[serde(default)]
    pub prohibitions: Vec<Rule>,
    #[serde(default)]
    pub obligations: Vec<Rule>,
}

impl Policy {
    /// Unconstrained permission to use `target`
    pub fn permit_use(target: &str, assigner: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            assigner: Some(assigner.to_string()),
            permissions: vec![Rule::new(USE_ACTION)],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub action: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Rule {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            constraints: Vec::new(),
        }
    }

    pub fn constrained(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub left: String,
    pub operator: Operator,
    pub right: PropertyValue,
}

impl Constraint {
    pub fn new(left: &str, operator: Operator, right: impl Into<PropertyValue>) -> Self {
        Self {
            left: left.to_string(),
            operator,
            right: right.into(),
        }
    }

    fn check(&self, ctx: &PolicyContext) -> Result<(), String> {
        let Some(value) = ctx.attribute(&self.left) else {
            return Err(format!("attribute '{}' is not available", self.left));
        };
        let criterion = Criterion::new(self.left.clone(), self.operator, self.right.clone());
        match criterion.test_value(&value) {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("constraint '{criterion}' not satisfied")),
            Err(e) => Err(format!("constraint '{criterion}' is malformed: {e}")),
        }
    }
}

/// What the evaluation is about: who asks, for which action, with which
/// claims
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyContext {
    pub counterparty_id: String,
    pub action: String,
    pub attributes: BTreeMap<String, PropertyValue>,
}

impl PolicyContext {
    pub fn new(counterparty_id: &str) -> Self {
        Self {
            counterparty_id: counterparty_id.to_string(),
            action: USE_ACTION.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<PropertyValue> {
        match key {
            "counterparty.id" => Some(PropertyValue::from(self.counterparty_id.as_str())),
            _ => self.attributes.get(key).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Valid,
    Violations(Vec<String>),
}

impl PolicyVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, PolicyVerdict::Valid)
    }

    fn from_violations(violations: Vec<String>) -> Self {
        if violations.is_empty() {
            PolicyVerdict::Valid
        } else {
            PolicyVerdict::Violations(violations)
        }
    }
}

pub trait PolicyEvaluator: Send + Sync {
    fn evaluate(&self, policy: &Policy, ctx: &PolicyContext) -> PolicyVerdict;
}

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl PolicyEvaluator for PermitAll {
    fn evaluate(&self, _policy: &Policy, _ctx: &PolicyContext) -> PolicyVerdict {
        PolicyVerdict::Valid
    }
}

/// Attribute-matching evaluator
///
/// - permissions: when any exist for the action, at least one must have all
///   its constraints satisfied
/// - prohibitions: a prohibition for the action whose constraints all hold
///   is a violation
/// - obligations: every obligation for the action must be satisfied
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleEvaluator;

impl PolicyEvaluator for RuleEvaluator {
    fn evaluate(&self, policy: &Policy, ctx: &PolicyContext) -> PolicyVerdict {
        let applies = |rule: &&Rule| rule.action == ctx.action;
        let mut violations = Vec::new();

        let permissions: Vec<&Rule> = policy.permissions.iter().filter(applies).collect();
        if !permissions.is_empty() {
            let mut reasons = Vec::new();
            let granted = permissions.iter().any(|rule| {
                let failed: Vec<String> = rule
                    .constraints
                    .iter()
                    .filter_map(|c| c.check(ctx).err())
                    .collect();
                let ok = failed.is_empty();
                reasons.extend(failed);
                ok
            });
            if !granted {
                violations.push(format!(
                    "no permission for '{}' is satisfied: {}",
                    ctx.action,
                    reasons.join("; ")
                ));
            }
        } else if !policy.permissions.is_empty() {
            violations.push(format!("action '{}' is not permitted", ctx.action));
        }

        for rule in policy.prohibitions.iter().filter(applies) {
            if rule.constraints.iter().all(|c| c.check(ctx).is_ok()) {
                violations.push(format!("action '{}' is prohibited", ctx.action));
            }
        }

        for rule in policy.obligations.iter().filter(applies) {
            violations.extend(
                rule.constraints
                    .iter()
                    .filter_map(|c| c.check(ctx).err())
                    .map(|r| format!("obligation unmet: {r}")),
            );
        }

        PolicyVerdict::from_violations(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_policy() -> Policy {
        Policy {
            permissions: vec![Rule::new(USE_ACTION).constrained(Constraint::new(
                "region",
                Operator::In,
                vec!["eu", "ch"],
            ))],
            ..Policy::permit_use("asset-1", "provider")
        }
    }

    #[test]
    fn test_permit_all() {
        assert!(PermitAll.evaluate(&region_policy(), &PolicyContext::new("x")).is_valid());
    }

    #[test]
    fn test_unconstrained_permission() {
        let verdict =
            RuleEvaluator.evaluate(&Policy::permit_use("a", "p"), &PolicyContext::new("c"));
        assert_eq!(verdict, PolicyVerdict::Valid);
    }

    #[test]
    fn test_constrained_permission() {
        let ok = PolicyContext::new("c").with_attribute("region", "eu");
        assert!(RuleEvaluator.evaluate(&region_policy(), &ok).is_valid());

        let wrong = PolicyContext::new("c").with_attribute("region", "us");
        let PolicyVerdict::Violations(v) = RuleEvaluator.evaluate(&region_policy(), &wrong) else {
            panic!("expected violation");
        };
        assert!(v[0].contains("region"));

        let missing = PolicyContext::new("c");
        let PolicyVerdict::Violations(v) = RuleEvaluator.evaluate(&region_policy(), &missing)
        else {
            panic!("expected violation");
        };
        assert!(v[0].contains("not available"));
    }

    #[test]
    fn test_prohibition_and_obligation() {
        let policy = Policy {
            prohibitions: vec![Rule::new(USE_ACTION).constrained(Constraint::new(
                "counterparty.id",
                Operator::Eq,
                "blocked",
            ))],
            obligations: vec![Rule::new(USE_ACTION).constrained(Constraint::new(
                "accepted_terms",
                Operator::Eq,
                true,
            ))],
            ..Policy::permit_use("a", "p")
        };

        let good = PolicyContext::new("fine").with_attribute("accepted_terms", true);
        assert!(RuleEvaluator.evaluate(&policy, &good).is_valid());

        let blocked = PolicyContext::new("blocked").with_attribute("accepted_terms", true);
        assert!(!RuleEvaluator.evaluate(&policy, &blocked).is_valid());

        let PolicyVerdict::Violations(v) =
            RuleEvaluator.evaluate(&policy, &PolicyContext::new("fine"))
        else {
            panic!("expected violation");
        };
        assert!(v[0].starts_with("obligation unmet"));
    }

    #[test]
    fn test_other_action_not_permitted() {
        let mut ctx = PolicyContext::new("c");
        ctx.action = "distribute".into();
        assert!(!RuleEvaluator.evaluate(&Policy::permit_use("a", "p"), &ctx).is_valid());
        assert!(RuleEvaluator.evaluate(&Policy::default(), &ctx).is_valid());
    }
}
