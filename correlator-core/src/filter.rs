use crate::alerts::{Alert, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Include,
    Exclude,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Include => "include",
            RuleAction::Exclude => "exclude",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "include" => Some(RuleAction::Include),
            "exclude" => Some(RuleAction::Exclude),
            _ => None,
        }
    }
}

/// Persisted, ordered predicate over alert labels.
///
/// `seq` is assigned by the store on insert and breaks priority ties, so
/// evaluation order is deterministic across restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: Uuid,
    pub seq: i64,
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
    pub match_labels: BTreeMap<String, String>,
    pub min_severity: Option<Severity>,
    pub action: RuleAction,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Included,
    Excluded,
}

/// Evaluate an alert against the rule set: enabled rules sorted by
/// (priority, seq), first match wins, no match defaults to Excluded.
/// Fail-closed — an alert no rule speaks for never opens an incident.
pub fn evaluate(alert: &Alert, rules: &[FilterRule]) -> FilterDecision {
    let mut ordered: Vec<&FilterRule> = rules.iter().filter(|rule| rule.enabled).collect();
    ordered.sort_by_key(|rule| (rule.priority, rule.seq));

    for rule in ordered {
        if matches(alert, rule) {
            return match rule.action {
                RuleAction::Include => FilterDecision::Included,
                RuleAction::Exclude => FilterDecision::Excluded,
            };
        }
    }
    FilterDecision::Excluded
}

fn matches(alert: &Alert, rule: &FilterRule) -> bool {
    let labels_match = rule
        .match_labels
        .iter()
        .all(|(key, value)| alert.labels.get(key) == Some(value));
    if !labels_match {
        return false;
    }
    match rule.min_severity {
        Some(min) => alert.severity() >= min,
        None => true,
    }
}
