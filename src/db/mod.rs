mod connection;
mod memory;
mod postgres;
mod schema;

pub use connection::*;
pub use memory::*;
pub use postgres::*;
pub use schema::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::plan::{PlanTree, SnapshotMetadata};
use crate::serializer::PlanGraph;

pub type ExplainId = i64;

/// Lifecycle of a statement with respect to plan capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementState {
    PendingExplain,
    Stale,
    Explained,
    Unexplainable,
}

impl StatementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementState::PendingExplain => "pending_explain",
            StatementState::Stale => "stale",
            StatementState::Explained => "explained",
            StatementState::Unexplainable => "unexplainable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_explain" => Some(StatementState::PendingExplain),
            "stale" => Some(StatementState::Stale),
            "explained" => Some(StatementState::Explained),
            "unexplainable" => Some(StatementState::Unexplainable),
            _ => None,
        }
    }

    /// State after a regular sighting of the statement in the workload.
    pub fn after_sighting(self) -> Self {
        match self {
            StatementState::Stale => StatementState::PendingExplain,
            other => other,
        }
    }

    /// State after the engine reported the cached plan as stale.
    pub fn after_stale(self, explain_now: bool) -> Self {
        match self {
            StatementState::PendingExplain | StatementState::Unexplainable => self,
            _ if explain_now => StatementState::PendingExplain,
            _ => StatementState::Stale,
        }
    }
}

impl fmt::Display for StatementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub id: String,
    pub text: String,
    pub created_on: DateTime<Utc>,
    pub last_log_time: DateTime<Utc>,
    pub state: StatementState,
    /// When a capture last failed without resolving the statement.
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Result of a dedup upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub created: bool,
    pub state: StatementState,
}

/// A persisted plan capture together with what the analysers need.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: ExplainId,
    pub statement_id: String,
    pub statement_text: String,
    pub created_on: DateTime<Utc>,
    pub metadata: SnapshotMetadata,
    pub plan: PlanTree,
}

/// A named declarative anti-pattern rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceCheck {
    pub name: String,
    pub severity: i32,
    pub description: String,
    /// Predicate as stored; interpreted by the rule engine.
    pub predicate: String,
    #[serde(default = "default_predicate_version")]
    pub version: i32,
}

fn default_predicate_version() -> i32 {
    1
}

/// VIOLATES edge from a snapshot to a check.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub check: String,
    pub severity: i32,
    /// Plan node ids that matched (AT_PLAN).
    pub at_plan: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CandidateKind {
    /// COULD_INDEX_PROPERTY: filter node whose property lookup ran over a scan.
    Property,
    /// COULD_INDEX_LABEL: the label scan underneath such a filter.
    Label,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Property => "property",
            CandidateKind::Label => "label",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexCandidate {
    pub kind: CandidateKind,
    pub plan_node: i64,
    pub label: Option<String>,
    pub property: Option<String>,
}

/// Aggregated (label, property) recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexRecommendation {
    pub label: Option<String>,
    pub property: String,
    pub count: i64,
}

/// Latest-snapshot-per-statement breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestStat {
    pub has_violation: bool,
    pub has_index: bool,
    pub count: i64,
}

/// Execution record attached to one sighting of a statement.
///
/// Durations are milliseconds. Every field is optional since log formats
/// differ in what they report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLog {
    pub level: Option<String>,
    pub query_time_ms: Option<i64>,
    pub planning_ms: Option<i64>,
    pub waiting_ms: Option<i64>,
    pub cpu_ms: Option<i64>,
    pub page_hits: Option<i64>,
    pub page_faults: Option<i64>,
    pub protocol: Option<String>,
    pub user: Option<String>,
    pub driver_version: Option<String>,
    pub client: Option<String>,
    pub server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub query_logs: i64,
    pub explains: i64,
    pub with_violations: i64,
}

/// Transactional store holding statements, plan graphs, checks and findings.
///
/// Every mutating method is a single atomic transaction.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Connectivity check used at startup.
    async fn ping(&self) -> Result<()>;

    /// Create the statement if absent, refresh `last_log_time`, apply a sighting.
    async fn record_sighting(
        &self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Upsert>;

    /// Create the statement if absent, refresh `last_log_time`, mark it stale.
    async fn record_stale(
        &self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
        explain_now: bool,
    ) -> Result<Upsert>;

    /// Attach an execution record to an existing statement. A record with the
    /// same `logged_at` is replaced.
    async fn record_query_log(
        &self,
        statement_id: &str,
        logged_at: DateTime<Utc>,
        log: &QueryLog,
    ) -> Result<()>;

    async fn statement(&self, id: &str) -> Result<Option<Statement>>;

    /// Pending statements, never-attempted first, then by oldest attempt.
    async fn statements_to_explain(&self, limit: usize) -> Result<Vec<Statement>>;

    /// Record a failed capture so the statement moves behind the rest of the queue.
    async fn defer_explain(&self, statement_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Persist a plan graph and move the statement to `explained`.
    ///
    /// Returns `None` without writing anything when the statement is no
    /// longer pending.
    async fn persist_plan(&self, statement_id: &str, graph: &PlanGraph)
        -> Result<Option<ExplainId>>;

    async fn mark_unexplainable(&self, statement_id: &str) -> Result<()>;

    /// Create the check unless one with the same name exists. Never overwrites.
    async fn create_check_if_absent(&self, check: &PerformanceCheck) -> Result<bool>;

    /// All checks in creation order.
    async fn performance_checks(&self) -> Result<Vec<PerformanceCheck>>;

    async fn explains_to_check(&self, limit: usize) -> Result<Vec<ExplainId>>;

    async fn load_snapshot(&self, id: ExplainId) -> Result<Option<Snapshot>>;

    async fn merge_violation(&self, id: ExplainId, violation: &Violation) -> Result<()>;

    async fn clear_pending_check(&self, id: ExplainId) -> Result<()>;

    async fn explains_to_index_check(&self, limit: usize) -> Result<Vec<ExplainId>>;

    /// Returns how many flags were actually cleared.
    async fn clear_pending_index_checks(&self, ids: &[ExplainId]) -> Result<u64>;

    /// Returns how many candidate edges were newly created.
    async fn merge_index_candidates(
        &self,
        id: ExplainId,
        candidates: &[IndexCandidate],
    ) -> Result<u64>;

    async fn index_recommendations(&self) -> Result<Vec<IndexRecommendation>>;

    async fn latest_stats(&self) -> Result<Vec<LatestStat>>;

    async fn daily_counts(&self) -> Result<Vec<DailyCount>>;
}
