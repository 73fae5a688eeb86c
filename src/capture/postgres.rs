use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde_json::{Map, Value};
use tracing::debug;

use super::{categorize_sqlstate, CaptureError, ErrorCategory, PlanCapture};
use crate::db::{create_pool, ConnectionConfig};
use crate::plan::{CapturedPlan, PlanNode, ServerInfo};

/// Expression keys, in order of preference, for `ExpressionString`.
const EXPRESSION_KEYS: &[&str] = &[
    "Filter",
    "Index Cond",
    "Recheck Cond",
    "Hash Cond",
    "Merge Cond",
    "Join Filter",
];

/// Captures plans with `EXPLAIN (FORMAT JSON)` on a PostgreSQL database.
///
/// The statement is planned, never executed.
pub struct PgExplainCapture {
    pool: Pool,
    address: String,
}

impl PgExplainCapture {
    pub fn new(pool: Pool, address: impl Into<String>) -> Self {
        Self {
            pool,
            address: address.into(),
        }
    }

    pub fn connect(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config)?, config.address()))
    }
}

fn capture_error(err: tokio_postgres::Error) -> CaptureError {
    match err.as_db_error() {
        Some(db_err) => {
            let category = categorize_sqlstate(db_err.code().code());
            if category.is_transient() {
                CaptureError::transient(err)
            } else {
                CaptureError::unexplainable(category, db_err.message())
            }
        }
        None => CaptureError::transient(err),
    }
}

#[async_trait]
impl PlanCapture for PgExplainCapture {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .with_context(|| format!("Failed to connect to capture database at {}", self.address))?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn capture(&self, text: &str) -> std::result::Result<CapturedPlan, CaptureError> {
        let client = self.pool.get().await.map_err(CaptureError::transient)?;

        let sql = format!("EXPLAIN (FORMAT JSON) {}", text.trim().trim_end_matches(';'));
        let row = client.query_one(sql.as_str(), &[]).await.map_err(capture_error)?;
        let output: Value = row.try_get(0).map_err(CaptureError::transient)?;

        let version: Option<String> = client
            .query_one("SHOW server_version", &[])
            .await
            .ok()
            .and_then(|r| r.try_get(0).ok());
        debug!(address = %self.address, ?version, "captured plan");

        let mut plan = plan_from_pg_json(&output).map_err(|e| {
            CaptureError::unexplainable(ErrorCategory::InvalidPlan, format!("{:#}", e))
        })?;
        plan.arguments
            .insert("planner-impl".to_string(), Value::from("postgres"));
        if let Some(version) = &version {
            plan.arguments
                .insert("version".to_string(), Value::from(version.as_str()));
        }

        Ok(CapturedPlan {
            plan,
            server: ServerInfo {
                address: Some(self.address.clone()),
                version,
            },
        })
    }
}

/// Convert `EXPLAIN (FORMAT JSON)` output into a plan tree.
///
/// Accepts the array PostgreSQL returns as well as a bare plan object.
pub fn plan_from_pg_json(output: &Value) -> Result<PlanNode> {
    let top = match output {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| anyhow!("EXPLAIN returned an empty result"))?,
        other => other,
    };
    let plan = top
        .get("Plan")
        .unwrap_or(top)
        .as_object()
        .ok_or_else(|| anyhow!("EXPLAIN output is not a plan object"))?;
    convert_node(plan)
}

fn convert_node(plan: &Map<String, Value>) -> Result<PlanNode> {
    let operator = plan
        .get("Node Type")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("plan node has no \"Node Type\""))?;
    let mut node = PlanNode::new(operator);

    if let Some(alias) = plan.get("Alias").and_then(Value::as_str) {
        node.identifiers.push(alias.to_string());
    }
    if let Some(rows) = plan.get("Plan Rows").filter(|v| v.is_number()) {
        node.arguments
            .insert("EstimatedRows".to_string(), rows.clone());
    }
    if let Some(expr) = EXPRESSION_KEYS
        .iter()
        .find_map(|key| plan.get(*key).and_then(Value::as_str))
    {
        node.arguments
            .insert("ExpressionString".to_string(), Value::from(expr));
    }
    if let Some(relation) = plan.get("Relation Name").and_then(Value::as_str) {
        node.arguments
            .insert("LabelName".to_string(), Value::from(relation));
    }
    if let Some(index) = plan.get("Index Name").and_then(Value::as_str) {
        node.arguments.insert("Index".to_string(), Value::from(index));
    }
    if let Some(keys) = plan.get("Sort Key").and_then(Value::as_array) {
        let keys: Vec<&str> = keys.iter().filter_map(Value::as_str).collect();
        node.arguments
            .insert("KeyNames".to_string(), Value::from(keys.join(", ")));
    }
    if let Some(details) = details(plan) {
        node.arguments.insert("Details".to_string(), Value::from(details));
    }

    if let Some(children) = plan.get("Plans").and_then(Value::as_array) {
        for child in children {
            let child = child
                .as_object()
                .ok_or_else(|| anyhow!("child plan is not an object"))?;
            node.children.push(convert_node(child)?);
        }
    }
    Ok(node)
}

fn details(plan: &Map<String, Value>) -> Option<String> {
    let parts: Vec<String> = ["Join Type", "Strategy", "Parent Relationship"]
        .iter()
        .filter_map(|key| {
            plan.get(*key)
                .and_then(Value::as_str)
                .map(|v| format!("{}: {}", key, v))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}
