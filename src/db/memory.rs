use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    CandidateKind, DailyCount, ExplainId, IndexCandidate, IndexRecommendation, LatestStat, PerformanceCheck,
    PlanStore, QueryLog, Snapshot, Statement, StatementState, Upsert, Violation,
};
use crate::plan::{PlanTree, SnapshotMetadata, StoredPlanNode};
use crate::serializer::PlanGraph;

/// Failpoint hit after the plan nodes are staged and before the snapshot is.
pub const FAIL_PERSIST_AFTER_NODES: &str = "persist_plan.after_nodes";
/// Failpoint hit when merging a violation.
pub const FAIL_MERGE_VIOLATION: &str = "merge_violation";
/// Failpoint hit when listing statements to explain.
pub const FAIL_LIST_STATEMENTS: &str = "statements_to_explain";
/// Failpoint hit when loading a snapshot.
pub const FAIL_LOAD_SNAPSHOT: &str = "load_snapshot";

#[derive(Debug, Clone)]
struct ExplainRow {
    id: ExplainId,
    statement_id: String,
    created_on: DateTime<Utc>,
    metadata: SnapshotMetadata,
    root_node: i64,
    pending_check: bool,
    pending_index_check: bool,
}

#[derive(Debug, Clone)]
struct NodeRow {
    id: i64,
    explain_id: ExplainId,
    alias: i32,
    operator_type: String,
    identifiers: Vec<String>,
    arguments: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    statements: BTreeMap<String, Statement>,
    query_logs: BTreeMap<(String, DateTime<Utc>), QueryLog>,
    explains: BTreeMap<ExplainId, ExplainRow>,
    nodes: BTreeMap<i64, NodeRow>,
    edges: Vec<(ExplainId, i64, i64)>,
    checks: Vec<PerformanceCheck>,
    violations: BTreeMap<(ExplainId, String), Violation>,
    candidates: BTreeSet<(ExplainId, IndexCandidate)>,
    pending_check_clears: BTreeMap<ExplainId, usize>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn upsert(
        &mut self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
        created_state: StatementState,
        transition: impl FnOnce(StatementState) -> StatementState,
    ) -> Upsert {
        match self.statements.get_mut(id) {
            Some(statement) => {
                statement.last_log_time = observed_at;
                statement.state = transition(statement.state);
                Upsert {
                    created: false,
                    state: statement.state,
                }
            }
            None => {
                self.statements.insert(
                    id.to_string(),
                    Statement {
                        id: id.to_string(),
                        text: text.to_string(),
                        created_on: Utc::now(),
                        last_log_time: observed_at,
                        state: created_state,
                        last_attempt: None,
                    },
                );
                Upsert {
                    created: true,
                    state: created_state,
                }
            }
        }
    }
}

/// In-process [`PlanStore`].
///
/// Each write runs against a private copy of the state which replaces the
/// shared one only when the whole operation succeeded, so a failure leaves
/// nothing behind. Failpoints inject errors at named steps.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failpoints: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation reaching `name` fail.
    pub fn fail_once(&self, name: &str) {
        if let Ok(mut failpoints) = self.failpoints.lock() {
            failpoints.insert(name.to_string());
        }
    }

    fn hit(&self, name: &str) -> Result<()> {
        let mut failpoints = self
            .failpoints
            .lock()
            .map_err(|_| anyhow!("memory store failpoints poisoned"))?;
        if failpoints.remove(name) {
            bail!("injected failure at {}", name);
        }
        Ok(())
    }

    fn read(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store state poisoned"))
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut guard = self.read()?;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        *guard = staged;
        Ok(out)
    }

    /// Number of plan nodes persisted across all snapshots.
    pub fn plan_node_count(&self) -> usize {
        self.read().map(|s| s.nodes.len()).unwrap_or_default()
    }

    pub fn query_logs(&self, statement_id: &str) -> Vec<QueryLog> {
        self.read()
            .map(|s| {
                s.query_logs
                    .iter()
                    .filter(|((id, _), _)| id == statement_id)
                    .map(|(_, log)| log.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn explain_ids(&self) -> Vec<ExplainId> {
        self.read()
            .map(|s| s.explains.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn violations(&self, id: ExplainId) -> Vec<Violation> {
        self.read()
            .map(|s| {
                s.violations
                    .iter()
                    .filter(|((explain, _), _)| *explain == id)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn index_candidates(&self, id: ExplainId) -> Vec<IndexCandidate> {
        self.read()
            .map(|s| {
                s.candidates
                    .iter()
                    .filter(|(explain, _)| *explain == id)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// How many times the pending-check flag of `id` was cleared.
    pub fn pending_check_clears(&self, id: ExplainId) -> usize {
        self.read()
            .ok()
            .and_then(|s| s.pending_check_clears.get(&id).copied())
            .unwrap_or_default()
    }

    pub fn is_pending_check(&self, id: ExplainId) -> bool {
        self.read()
            .ok()
            .and_then(|s| s.explains.get(&id).map(|e| e.pending_check))
            .unwrap_or_default()
    }

    /// Flag existing snapshots for index inference again.
    pub fn reset_index_checks(&self) {
        if let Ok(mut state) = self.state.lock() {
            for explain in state.explains.values_mut() {
                explain.pending_index_check = true;
            }
        }
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    async fn record_sighting(
        &self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Upsert> {
        self.write(|state| {
            Ok(state.upsert(
                id,
                text,
                observed_at,
                StatementState::PendingExplain,
                StatementState::after_sighting,
            ))
        })
    }

    async fn record_stale(
        &self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
        explain_now: bool,
    ) -> Result<Upsert> {
        let created_state = if explain_now {
            StatementState::PendingExplain
        } else {
            StatementState::Stale
        };
        self.write(|state| {
            Ok(state.upsert(id, text, observed_at, created_state, |s| {
                s.after_stale(explain_now)
            }))
        })
    }

    async fn record_query_log(
        &self,
        statement_id: &str,
        logged_at: DateTime<Utc>,
        log: &QueryLog,
    ) -> Result<()> {
        self.write(|state| {
            if !state.statements.contains_key(statement_id) {
                bail!("no statement {}", statement_id);
            }
            state
                .query_logs
                .insert((statement_id.to_string(), logged_at), log.clone());
            Ok(())
        })
    }

    async fn statement(&self, id: &str) -> Result<Option<Statement>> {
        Ok(self.read()?.statements.get(id).cloned())
    }

    async fn statements_to_explain(&self, limit: usize) -> Result<Vec<Statement>> {
        self.hit(FAIL_LIST_STATEMENTS)?;
        let state = self.read()?;
        let mut pending: Vec<&Statement> = state
            .statements
            .values()
            .filter(|s| s.state == StatementState::PendingExplain)
            .collect();
        pending.sort_by_key(|s| (s.last_attempt, s.last_log_time));
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn defer_explain(&self, statement_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.write(|state| {
            if let Some(statement) = state.statements.get_mut(statement_id) {
                statement.last_attempt = Some(at);
            }
            Ok(())
        })
    }

    async fn persist_plan(
        &self,
        statement_id: &str,
        graph: &PlanGraph,
    ) -> Result<Option<ExplainId>> {
        self.write(|state| {
            match state.statements.get(statement_id) {
                Some(s) if s.state == StatementState::PendingExplain => {}
                _ => return Ok(None),
            }

            let explain_id = state.next_id();
            let mut ids = BTreeMap::new();
            for node in &graph.nodes {
                let id = state.next_id();
                ids.insert(node.alias, id);
                state.nodes.insert(
                    id,
                    NodeRow {
                        id,
                        explain_id,
                        alias: node.alias as i32,
                        operator_type: node.operator_type.clone(),
                        identifiers: node.identifiers.clone(),
                        arguments: node.arguments.clone(),
                    },
                );
            }
            for edge in &graph.edges {
                let (Some(&parent), Some(&child)) = (ids.get(&edge.parent), ids.get(&edge.child))
                else {
                    bail!("edge {} -> {} references an unknown alias", edge.parent, edge.child);
                };
                state.edges.push((explain_id, parent, child));
            }

            self.hit(FAIL_PERSIST_AFTER_NODES)?;

            let root_node = *ids
                .get(&graph.root)
                .ok_or_else(|| anyhow!("plan graph has no root node"))?;
            state.explains.insert(
                explain_id,
                ExplainRow {
                    id: explain_id,
                    statement_id: statement_id.to_string(),
                    created_on: Utc::now(),
                    metadata: graph.metadata.clone(),
                    root_node,
                    pending_check: true,
                    pending_index_check: true,
                },
            );
            if let Some(statement) = state.statements.get_mut(statement_id) {
                statement.state = StatementState::Explained;
            }
            Ok(Some(explain_id))
        })
    }

    async fn mark_unexplainable(&self, statement_id: &str) -> Result<()> {
        self.write(|state| {
            if let Some(statement) = state.statements.get_mut(statement_id) {
                statement.state = StatementState::Unexplainable;
            }
            Ok(())
        })
    }

    async fn create_check_if_absent(&self, check: &PerformanceCheck) -> Result<bool> {
        self.write(|state| {
            if state.checks.iter().any(|c| c.name == check.name) {
                return Ok(false);
            }
            state.checks.push(check.clone());
            Ok(true)
        })
    }

    async fn performance_checks(&self) -> Result<Vec<PerformanceCheck>> {
        Ok(self.read()?.checks.clone())
    }

    async fn explains_to_check(&self, limit: usize) -> Result<Vec<ExplainId>> {
        Ok(self
            .read()?
            .explains
            .values()
            .filter(|e| e.pending_check)
            .take(limit)
            .map(|e| e.id)
            .collect())
    }

    async fn load_snapshot(&self, id: ExplainId) -> Result<Option<Snapshot>> {
        self.hit(FAIL_LOAD_SNAPSHOT)?;
        let state = self.read()?;
        let Some(explain) = state.explains.get(&id) else {
            return Ok(None);
        };
        let statement = state
            .statements
            .get(&explain.statement_id)
            .ok_or_else(|| anyhow!("explain {} has no statement", id))?;

        let nodes: Vec<StoredPlanNode> = state
            .nodes
            .values()
            .filter(|n| n.explain_id == id)
            .map(|n| StoredPlanNode {
                id: n.id,
                alias: n.alias,
                operator_type: n.operator_type.clone(),
                identifiers: n.identifiers.clone(),
                arguments: n.arguments.clone(),
                children: Vec::new(),
            })
            .collect();
        let edges: Vec<(i64, i64)> = state
            .edges
            .iter()
            .filter(|(explain, _, _)| *explain == id)
            .map(|(_, parent, child)| (*parent, *child))
            .collect();
        let plan = PlanTree::from_parts(nodes, &edges)
            .ok_or_else(|| anyhow!("explain {} has a malformed plan tree", id))?;
        if plan.root_node().id != explain.root_node {
            bail!("explain {} root does not match its plan tree", id);
        }

        Ok(Some(Snapshot {
            id,
            statement_id: statement.id.clone(),
            statement_text: statement.text.clone(),
            created_on: explain.created_on,
            metadata: explain.metadata.clone(),
            plan,
        }))
    }

    async fn merge_violation(&self, id: ExplainId, violation: &Violation) -> Result<()> {
        self.hit(FAIL_MERGE_VIOLATION)?;
        self.write(|state| {
            if !state.checks.iter().any(|c| c.name == violation.check) {
                bail!("no performance check named {}", violation.check);
            }
            state
                .violations
                .insert((id, violation.check.clone()), violation.clone());
            Ok(())
        })
    }

    async fn clear_pending_check(&self, id: ExplainId) -> Result<()> {
        self.write(|state| {
            if let Some(explain) = state.explains.get_mut(&id) {
                explain.pending_check = false;
                *state.pending_check_clears.entry(id).or_default() += 1;
            }
            Ok(())
        })
    }

    async fn explains_to_index_check(&self, limit: usize) -> Result<Vec<ExplainId>> {
        Ok(self
            .read()?
            .explains
            .values()
            .filter(|e| e.pending_index_check)
            .take(limit)
            .map(|e| e.id)
            .collect())
    }

    async fn clear_pending_index_checks(&self, ids: &[ExplainId]) -> Result<u64> {
        self.write(|state| {
            let mut cleared = 0;
            for id in ids {
                if let Some(explain) = state.explains.get_mut(id) {
                    if explain.pending_index_check {
                        explain.pending_index_check = false;
                        cleared += 1;
                    }
                }
            }
            Ok(cleared)
        })
    }

    async fn merge_index_candidates(
        &self,
        id: ExplainId,
        candidates: &[IndexCandidate],
    ) -> Result<u64> {
        self.write(|state| {
            let mut created = 0;
            for candidate in candidates {
                if state.candidates.insert((id, candidate.clone())) {
                    created += 1;
                }
            }
            Ok(created)
        })
    }

    async fn index_recommendations(&self) -> Result<Vec<IndexRecommendation>> {
        let state = self.read()?;
        let mut counts: BTreeMap<(Option<String>, String), i64> = BTreeMap::new();
        for (_, candidate) in &state.candidates {
            if let (CandidateKind::Property, Some(property)) =
                (candidate.kind, &candidate.property)
            {
                *counts
                    .entry((candidate.label.clone(), property.clone()))
                    .or_default() += 1;
            }
        }
        let mut out: Vec<IndexRecommendation> = counts
            .into_iter()
            .map(|((label, property), count)| IndexRecommendation {
                label,
                property,
                count,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(out)
    }

    async fn latest_stats(&self) -> Result<Vec<LatestStat>> {
        let state = self.read()?;
        let mut latest: BTreeMap<&str, &ExplainRow> = BTreeMap::new();
        for explain in state.explains.values() {
            let entry = latest.entry(explain.statement_id.as_str()).or_insert(explain);
            if (explain.created_on, explain.id) > (entry.created_on, entry.id) {
                *entry = explain;
            }
        }

        let mut counts: BTreeMap<(bool, bool), i64> = BTreeMap::new();
        for explain in latest.values() {
            let has_violation = state.violations.keys().any(|(id, _)| *id == explain.id);
            let has_index = state.candidates.iter().any(|(id, _)| *id == explain.id);
            *counts.entry((has_violation, has_index)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((has_violation, has_index), count)| LatestStat {
                has_violation,
                has_index,
                count,
            })
            .collect())
    }

    async fn daily_counts(&self) -> Result<Vec<DailyCount>> {
        let state = self.read()?;
        let mut days: BTreeMap<NaiveDate, (i64, i64, i64)> = BTreeMap::new();
        for (_, logged_at) in state.query_logs.keys() {
            days.entry(logged_at.date_naive()).or_default().0 += 1;
        }
        for explain in state.explains.values() {
            let violates = state.violations.keys().any(|(id, _)| *id == explain.id);
            let day = days.entry(explain.created_on.date_naive()).or_default();
            day.1 += 1;
            day.2 += i64::from(violates);
        }
        Ok(days
            .into_iter()
            .map(|(date, (query_logs, explains, with_violations))| DailyCount {
                date,
                query_logs,
                explains,
                with_violations,
            })
            .collect())
    }
}
