//! Index inference: spot filters over scans that an index could replace.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{CandidateKind, ExplainId, IndexCandidate, PlanStore, Snapshot};
use crate::plan::StoredPlanNode;

/// Expression arguments a filter may carry, in order of preference.
const EXPRESSION_ARGUMENTS: &[&str] = &["ExpressionString", "Details", "LegacyExpression"];
const LABEL_SCAN: &str = "NodeByLabelScan";
const ALL_NODES_SCAN: &str = "AllNodesScan";
/// Furthest a scan may sit below the filter it feeds.
const MAX_HOPS: usize = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub processed: usize,
    pub created: u64,
}

pub struct IndexInferenceEngine {
    store: Arc<dyn PlanStore>,
    batch_size: usize,
}

impl IndexInferenceEngine {
    pub fn new(store: Arc<dyn PlanStore>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    /// Process batches until one finds nothing pending.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let (processed, created) = self.process_batch().await?;
            if processed == 0 {
                break;
            }
            report.batches += 1;
            report.processed += processed;
            report.created += created;
        }
        if report.processed > 0 {
            info!(
                batches = report.batches,
                snapshots = report.processed,
                candidates = report.created,
                "index inference drained"
            );
        }
        Ok(report)
    }

    /// One batch. Flags are cleared before analysis; a snapshot that fails
    /// is not retried.
    async fn process_batch(&self) -> Result<(usize, u64)> {
        let ids = self.store.explains_to_index_check(self.batch_size).await?;
        if ids.is_empty() {
            return Ok((0, 0));
        }
        self.store
            .clear_pending_index_checks(&ids)
            .await
            .context("Failed to clear pending index checks")?;

        let mut created = 0;
        for &id in &ids {
            match self.infer(id).await {
                Ok(n) => created += n,
                Err(e) => warn!(explain_id = id, error = %e, "index inference failed"),
            }
        }
        Ok((ids.len(), created))
    }

    async fn infer(&self, id: ExplainId) -> Result<u64> {
        let Some(snapshot) = self.store.load_snapshot(id).await? else {
            return Ok(0);
        };
        let candidates = find_candidates(&snapshot);
        if candidates.is_empty() {
            return Ok(0);
        }
        debug!(explain_id = id, candidates = candidates.len(), "found index candidates");
        self.store.merge_index_candidates(id, &candidates).await
    }
}

/// All index candidates in one snapshot, deduplicated.
pub fn find_candidates(snapshot: &Snapshot) -> Vec<IndexCandidate> {
    let plan = &snapshot.plan;
    let mut found = BTreeSet::new();

    for (idx, filter) in plan.nodes.iter().enumerate() {
        if filter.operator_type != "Filter" {
            continue;
        }
        let Some(expression) = EXPRESSION_ARGUMENTS
            .iter()
            .find_map(|key| filter.argument_str(key))
        else {
            continue;
        };
        let accesses = property_accesses(expression);
        if accesses.is_empty() {
            continue;
        }

        for (scan_idx, hops) in plan.descendants_with_depth(idx) {
            let scan = plan.node(scan_idx);
            if hops > MAX_HOPS || (scan.operator_type != LABEL_SCAN && scan.operator_type != ALL_NODES_SCAN) {
                continue;
            }
            for (var, property) in &accesses {
                if !scan.identifiers.is_empty() && !scan.identifiers.iter().any(|i| i == var) {
                    continue;
                }
                let label = resolve_label(scan, var, expression, &snapshot.statement_text);
                found.insert(IndexCandidate {
                    kind: CandidateKind::Property,
                    plan_node: filter.id,
                    label: label.clone(),
                    property: Some(property.clone()),
                });
                if scan.operator_type == LABEL_SCAN {
                    found.insert(IndexCandidate {
                        kind: CandidateKind::Label,
                        plan_node: scan.id,
                        label,
                        property: None,
                    });
                }
            }
        }
    }
    found.into_iter().collect()
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Take the identifier at the start of `s`.
fn leading_ident(s: &str) -> Option<&str> {
    let end = s.find(|c: char| !is_ident_char(c)).unwrap_or(s.len());
    let ident = &s[..end];
    match ident.chars().next() {
        Some(c) if !c.is_numeric() => Some(ident),
        _ => None,
    }
}

/// `var.prop` pairs in an expression, in order of appearance.
pub fn property_accesses(expression: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut prev: Option<char> = None;
    for (pos, c) in expression.char_indices() {
        let starts_word = is_ident_char(c) && !prev.is_some_and(|p| is_ident_char(p) || p == '.');
        prev = Some(c);
        if !starts_word {
            continue;
        }
        let rest = &expression[pos..];
        let Some(var) = leading_ident(rest) else {
            continue;
        };
        let Some(after_dot) = rest[var.len()..].strip_prefix('.') else {
            continue;
        };
        let Some(property) = leading_ident(after_dot) else {
            continue;
        };
        let pair = (var.to_string(), property.to_string());
        if !out.contains(&pair) {
            out.push(pair);
        }
    }
    out
}

/// Label following `var:` in `text`, where `var` starts a word.
fn label_after(text: &str, var: &str, open_paren: bool) -> Option<String> {
    let needle = if open_paren {
        format!("({}:", var)
    } else {
        format!("{}:", var)
    };
    text.match_indices(&needle).find_map(|(pos, _)| {
        let bounded = open_paren
            || !text[..pos]
                .chars()
                .next_back()
                .is_some_and(|p| is_ident_char(p) || p == '.');
        if !bounded {
            return None;
        }
        leading_ident(&text[pos + needle.len()..]).map(str::to_string)
    })
}

fn resolve_label(scan: &StoredPlanNode, var: &str, expression: &str, statement: &str) -> Option<String> {
    if let Some(label) = scan.argument_str("LabelName") {
        let label = label.trim_start_matches(':');
        if !label.is_empty() {
            return Some(label.to_string());
        }
    }
    if let Some(details) = scan.argument_str("Details") {
        if let Some((_, rest)) = details.split_once(':') {
            if let Some(label) = leading_ident(rest) {
                return Some(label.to_string());
            }
        }
    }
    label_after(expression, var, false).or_else(|| label_after(statement, var, true))
}
