use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::Snapshot;

/// Severity reduction for each matching operator found under a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Discount {
    pub operators: Vec<String>,
    pub per_match: i32,
}

/// Declarative anti-pattern predicate, stored as JSON on a performance check.
///
/// A plan matches when the statement text contains `statement_contains`
/// (case-insensitive) and some operator strictly below the plan root is one
/// of `operators`. With no `operators` the text condition alone decides and
/// the match is reported at the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<Discount>,
}

/// Outcome of evaluating one predicate against one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub severity: i32,
    pub at_plan: Vec<i64>,
}

impl Predicate {
    pub fn parse(text: &str) -> Result<Self> {
        let predicate: Predicate =
            serde_json::from_str(text).context("Predicate is not valid JSON")?;
        predicate.validate()?;
        Ok(predicate)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let has_text = self
            .statement_contains
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if !has_text && self.operators.is_empty() {
            bail!("Predicate needs statement_contains or operators");
        }
        if self.operators.iter().any(|op| op.trim().is_empty()) {
            bail!("Predicate operators must not be empty strings");
        }
        if let Some(discount) = &self.discount {
            if discount.operators.is_empty() {
                bail!("Discount needs at least one operator");
            }
            if discount.per_match < 0 {
                bail!("Discount per_match must not be negative");
            }
        }
        Ok(())
    }

    /// Evaluate against a snapshot, starting from `base` severity.
    ///
    /// Each matched node is discounted separately; the highest severity wins
    /// and every matched node id is reported. Severities are not clamped.
    pub fn evaluate(&self, snapshot: &Snapshot, base: i32) -> Option<Match> {
        if let Some(needle) = &self.statement_contains {
            if !snapshot
                .statement_text
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return None;
            }
        }

        let plan = &snapshot.plan;
        if self.operators.is_empty() {
            return Some(Match {
                severity: base,
                at_plan: vec![plan.root_node().id],
            });
        }

        let mut severity = None;
        let mut at_plan = Vec::new();
        for idx in plan.descendants(plan.root) {
            let node = plan.node(idx);
            if !self.operators.contains(&node.operator_type) {
                continue;
            }
            let score = base.saturating_sub(self.discount_below(snapshot, idx));
            severity = Some(severity.map_or(score, |s: i32| s.max(score)));
            at_plan.push(node.id);
        }

        severity.map(|severity| Match { severity, at_plan })
    }

    fn discount_below(&self, snapshot: &Snapshot, idx: usize) -> i32 {
        let Some(discount) = &self.discount else {
            return 0;
        };
        let hits = snapshot
            .plan
            .descendants(idx)
            .into_iter()
            .filter(|&i| discount.operators.contains(&snapshot.plan.node(i).operator_type))
            .count();
        let hits = i32::try_from(hits).unwrap_or(i32::MAX);
        discount.per_match.saturating_mul(hits)
    }
}
