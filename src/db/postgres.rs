use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::Row;

use super::{
    create_pool, init_schema, ConnectionConfig, DailyCount, ExplainId, IndexCandidate,
    IndexRecommendation, LatestStat, PerformanceCheck, PlanStore, QueryLog, Snapshot, Statement,
    StatementState, Upsert, Violation,
};
use crate::plan::{PlanTree, SnapshotMetadata, StoredPlanNode};
use crate::serializer::PlanGraph;

const STATEMENT_COLUMNS: &str = "id, text, created_on, last_log_time, state, last_attempt";

const UPSERT_SIGHTING: &str = r#"
    INSERT INTO statements (id, text, last_log_time, state)
    VALUES ($1, $2, $3, 'pending_explain')
    ON CONFLICT (id) DO UPDATE SET
        last_log_time = EXCLUDED.last_log_time,
        state = CASE WHEN statements.state = 'stale' THEN 'pending_explain'
                     ELSE statements.state END
    RETURNING (xmax = 0) AS created, state
"#;

const UPSERT_STALE: &str = r#"
    INSERT INTO statements (id, text, last_log_time, state)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (id) DO UPDATE SET
        last_log_time = EXCLUDED.last_log_time,
        state = CASE WHEN statements.state IN ('pending_explain', 'unexplainable')
                     THEN statements.state
                     ELSE EXCLUDED.state END
    RETURNING (xmax = 0) AS created, state
"#;

const MERGE_QUERY_LOG: &str = r#"
    INSERT INTO query_logs (
        statement_id, logged_at, level, query_time_ms, planning_ms, waiting_ms, cpu_ms,
        page_hits, page_faults, protocol, username, driver_version, client, server
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
    ON CONFLICT (statement_id, logged_at) DO UPDATE SET
        level = EXCLUDED.level,
        query_time_ms = EXCLUDED.query_time_ms,
        planning_ms = EXCLUDED.planning_ms,
        waiting_ms = EXCLUDED.waiting_ms,
        cpu_ms = EXCLUDED.cpu_ms,
        page_hits = EXCLUDED.page_hits,
        page_faults = EXCLUDED.page_faults,
        protocol = EXCLUDED.protocol,
        username = EXCLUDED.username,
        driver_version = EXCLUDED.driver_version,
        client = EXCLUDED.client,
        server = EXCLUDED.server
"#;

const INSERT_EXPLAIN: &str = r#"
    INSERT INTO explains (
        statement_id, server_address, server_version, planner, planner_impl,
        planner_version, runtime, runtime_impl, runtime_version, version
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING id
"#;

const INSERT_PLAN_NODE: &str = r#"
    INSERT INTO plan_nodes (explain_id, alias, operator_type, identifiers, arguments)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id
"#;

const MERGE_VIOLATION: &str = r#"
    INSERT INTO violations (explain_id, check_id, severity, at_plan)
    SELECT $1::BIGINT, c.id, $3::INTEGER, $4::BIGINT[] FROM performance_checks c WHERE c.name = $2
    ON CONFLICT (explain_id, check_id) DO UPDATE SET
        severity = EXCLUDED.severity,
        at_plan = EXCLUDED.at_plan
"#;

const MERGE_CANDIDATE: &str = r#"
    INSERT INTO index_candidates (explain_id, plan_node_id, kind, label, property)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT DO NOTHING
"#;

const LOAD_EXPLAIN: &str = r#"
    SELECT e.id, e.statement_id, s.text, e.created_on, e.root_node_id,
           e.server_address, e.server_version, e.planner, e.planner_impl,
           e.planner_version, e.runtime, e.runtime_impl, e.runtime_version, e.version
    FROM explains e
    JOIN statements s ON s.id = e.statement_id
    WHERE e.id = $1
"#;

const INDEX_RECOMMENDATIONS: &str = r#"
    SELECT NULLIF(label, '') AS label, property, count(*) AS count
    FROM index_candidates
    WHERE kind = 'property' AND property <> ''
    GROUP BY label, property
    ORDER BY count DESC, label, property
"#;

const LATEST_STATS: &str = r#"
    WITH latest AS (
        SELECT DISTINCT ON (statement_id) id
        FROM explains
        ORDER BY statement_id, created_on DESC, id DESC
    )
    SELECT EXISTS (SELECT 1 FROM violations v WHERE v.explain_id = l.id) AS has_violation,
           EXISTS (SELECT 1 FROM index_candidates c WHERE c.explain_id = l.id) AS has_index,
           count(*) AS count
    FROM latest l
    GROUP BY 1, 2
    ORDER BY 1, 2
"#;

const DAILY_COUNTS: &str = r#"
    WITH logs AS (
        SELECT logged_at::date AS date, count(*) AS query_logs
        FROM query_logs
        GROUP BY 1
    ),
    plans AS (
        SELECT e.created_on::date AS date,
               count(*) AS explains,
               count(*) FILTER (
                   WHERE EXISTS (SELECT 1 FROM violations v WHERE v.explain_id = e.id)
               ) AS with_violations
        FROM explains e
        GROUP BY 1
    )
    SELECT COALESCE(l.date, p.date) AS date,
           COALESCE(l.query_logs, 0) AS query_logs,
           COALESCE(p.explains, 0) AS explains,
           COALESCE(p.with_violations, 0) AS with_violations
    FROM logs l
    FULL OUTER JOIN plans p ON p.date = l.date
    ORDER BY 1
"#;

/// [`PlanStore`] backed by PostgreSQL.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn connect(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config)?))
    }

    pub async fn init_schema(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        init_schema(pg(&mut conn)).await
    }

    async fn conn(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .context("Failed to get a store connection")
    }
}

fn pg(conn: &mut deadpool_postgres::Client) -> &mut tokio_postgres::Client {
    conn
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn statement_from_row(row: &Row) -> Result<Statement> {
    let state: String = row.get("state");
    Ok(Statement {
        id: row.get("id"),
        text: row.get("text"),
        created_on: row.get("created_on"),
        last_log_time: row.get("last_log_time"),
        state: StatementState::parse(&state)
            .ok_or_else(|| anyhow!("unknown statement state {:?}", state))?,
        last_attempt: row.get("last_attempt"),
    })
}

fn upsert_from_row(row: &Row) -> Result<Upsert> {
    let state: String = row.get("state");
    Ok(Upsert {
        created: row.get("created"),
        state: StatementState::parse(&state)
            .ok_or_else(|| anyhow!("unknown statement state {:?}", state))?,
    })
}

fn arguments_from_value(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

#[async_trait]
impl PlanStore for PgStore {
    async fn ping(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[])
            .await
            .context("Store did not answer")?;
        Ok(())
    }

    async fn record_sighting(
        &self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Upsert> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(UPSERT_SIGHTING, &[&id, &text, &observed_at])
            .await
            .context("Failed to upsert statement")?;
        upsert_from_row(&row)
    }

    async fn record_stale(
        &self,
        id: &str,
        text: &str,
        observed_at: DateTime<Utc>,
        explain_now: bool,
    ) -> Result<Upsert> {
        let state = if explain_now {
            StatementState::PendingExplain
        } else {
            StatementState::Stale
        };
        let conn = self.conn().await?;
        let row = conn
            .query_one(UPSERT_STALE, &[&id, &text, &observed_at, &state.as_str()])
            .await
            .context("Failed to mark statement stale")?;
        upsert_from_row(&row)
    }

    async fn record_query_log(
        &self,
        statement_id: &str,
        logged_at: DateTime<Utc>,
        log: &QueryLog,
    ) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            MERGE_QUERY_LOG,
            &[
                &statement_id,
                &logged_at,
                &log.level,
                &log.query_time_ms,
                &log.planning_ms,
                &log.waiting_ms,
                &log.cpu_ms,
                &log.page_hits,
                &log.page_faults,
                &log.protocol,
                &log.user,
                &log.driver_version,
                &log.client,
                &log.server,
            ],
        )
        .await
        .context("Failed to save query log")?;
        Ok(())
    }

    async fn statement(&self, id: &str) -> Result<Option<Statement>> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {} FROM statements WHERE id = $1", STATEMENT_COLUMNS);
        conn.query_opt(sql.as_str(), &[&id])
            .await?
            .map(|row| statement_from_row(&row))
            .transpose()
    }

    async fn statements_to_explain(&self, max: usize) -> Result<Vec<Statement>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM statements WHERE state = 'pending_explain' \
             ORDER BY last_attempt NULLS FIRST, last_log_time LIMIT $1",
            STATEMENT_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&limit(max)])
            .await
            .context("Failed to list statements to explain")?;
        rows.iter().map(statement_from_row).collect()
    }

    async fn defer_explain(&self, statement_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE statements SET last_attempt = $2 WHERE id = $1",
            &[&statement_id, &at],
        )
        .await
        .context("Failed to defer statement")?;
        Ok(())
    }

    async fn persist_plan(
        &self,
        statement_id: &str,
        graph: &PlanGraph,
    ) -> Result<Option<ExplainId>> {
        let mut conn = self.conn().await?;
        let tx = pg(&mut conn).transaction().await?;

        let current = tx
            .query_opt(
                "SELECT state FROM statements WHERE id = $1 FOR UPDATE",
                &[&statement_id],
            )
            .await?;
        match current {
            Some(row) if row.get::<_, String>(0) == StatementState::PendingExplain.as_str() => {}
            _ => return Ok(None),
        }

        let meta = &graph.metadata;
        let explain_id: i64 = tx
            .query_one(
                INSERT_EXPLAIN,
                &[
                    &statement_id,
                    &meta.server_address,
                    &meta.server_version,
                    &meta.planner,
                    &meta.planner_impl,
                    &meta.planner_version,
                    &meta.runtime,
                    &meta.runtime_impl,
                    &meta.runtime_version,
                    &meta.version,
                ],
            )
            .await
            .context("Failed to create explain snapshot")?
            .get(0);

        let insert_node = tx.prepare(INSERT_PLAN_NODE).await?;
        let mut ids: HashMap<usize, i64> = HashMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            let alias = i32::try_from(node.alias).context("plan alias out of range")?;
            let arguments = serde_json::to_value(&node.arguments)?;
            let id: i64 = tx
                .query_one(
                    &insert_node,
                    &[
                        &explain_id,
                        &alias,
                        &node.operator_type,
                        &node.identifiers,
                        &arguments,
                    ],
                )
                .await
                .context("Failed to create plan node")?
                .get(0);
            ids.insert(node.alias, id);
        }

        for edge in &graph.edges {
            let (Some(parent), Some(child)) = (ids.get(&edge.parent), ids.get(&edge.child)) else {
                bail!("edge {} -> {} references an unknown alias", edge.parent, edge.child);
            };
            tx.execute(
                "INSERT INTO plan_edges (parent_id, child_id) VALUES ($1, $2)",
                &[parent, child],
            )
            .await
            .context("Failed to link plan nodes")?;
        }

        let root = ids
            .get(&graph.root)
            .ok_or_else(|| anyhow!("plan graph has no root node"))?;
        tx.execute(
            "UPDATE explains SET root_node_id = $2 WHERE id = $1",
            &[&explain_id, root],
        )
        .await?;
        tx.execute(
            "UPDATE statements SET state = 'explained' WHERE id = $1",
            &[&statement_id],
        )
        .await?;

        tx.commit().await.context("Failed to commit plan graph")?;
        Ok(Some(explain_id))
    }

    async fn mark_unexplainable(&self, statement_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE statements SET state = 'unexplainable' WHERE id = $1",
            &[&statement_id],
        )
        .await
        .context("Failed to mark statement unexplainable")?;
        Ok(())
    }

    async fn create_check_if_absent(&self, check: &PerformanceCheck) -> Result<bool> {
        let conn = self.conn().await?;
        let created = conn
            .execute(
                r#"
                INSERT INTO performance_checks (name, severity, description, predicate, version)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (name) DO NOTHING
                "#,
                &[
                    &check.name,
                    &check.severity,
                    &check.description,
                    &check.predicate,
                    &check.version,
                ],
            )
            .await
            .with_context(|| format!("Failed to save performance check {}", check.name))?;
        Ok(created == 1)
    }

    async fn performance_checks(&self) -> Result<Vec<PerformanceCheck>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT name, severity, description, predicate, version FROM performance_checks ORDER BY id",
                &[],
            )
            .await
            .context("Failed to load performance checks")?;
        Ok(rows
            .iter()
            .map(|row| PerformanceCheck {
                name: row.get("name"),
                severity: row.get("severity"),
                description: row.get("description"),
                predicate: row.get("predicate"),
                version: row.get("version"),
            })
            .collect())
    }

    async fn explains_to_check(&self, max: usize) -> Result<Vec<ExplainId>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM explains WHERE pending_check ORDER BY id LIMIT $1",
                &[&limit(max)],
            )
            .await
            .context("Failed to list explains to check")?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn load_snapshot(&self, id: ExplainId) -> Result<Option<Snapshot>> {
        let conn = self.conn().await?;
        let Some(row) = conn.query_opt(LOAD_EXPLAIN, &[&id]).await? else {
            return Ok(None);
        };

        let nodes: Vec<StoredPlanNode> = conn
            .query(
                "SELECT id, alias, operator_type, identifiers, arguments FROM plan_nodes WHERE explain_id = $1",
                &[&id],
            )
            .await?
            .iter()
            .map(|n| StoredPlanNode {
                id: n.get("id"),
                alias: n.get("alias"),
                operator_type: n.get("operator_type"),
                identifiers: n.get("identifiers"),
                arguments: arguments_from_value(n.get("arguments")),
                children: Vec::new(),
            })
            .collect();
        let edges: Vec<(i64, i64)> = conn
            .query(
                r#"
                SELECT pe.parent_id, pe.child_id
                FROM plan_edges pe
                JOIN plan_nodes p ON p.id = pe.parent_id
                WHERE p.explain_id = $1
                "#,
                &[&id],
            )
            .await?
            .iter()
            .map(|e| (e.get(0), e.get(1)))
            .collect();

        let plan = PlanTree::from_parts(nodes, &edges)
            .ok_or_else(|| anyhow!("explain {} has a malformed plan tree", id))?;
        let root: Option<i64> = row.get("root_node_id");
        if root != Some(plan.root_node().id) {
            bail!("explain {} root does not match its plan tree", id);
        }

        Ok(Some(Snapshot {
            id,
            statement_id: row.get("statement_id"),
            statement_text: row.get("text"),
            created_on: row.get("created_on"),
            metadata: SnapshotMetadata {
                server_address: row.get("server_address"),
                server_version: row.get("server_version"),
                planner: row.get("planner"),
                planner_impl: row.get("planner_impl"),
                planner_version: row.get("planner_version"),
                runtime: row.get("runtime"),
                runtime_impl: row.get("runtime_impl"),
                runtime_version: row.get("runtime_version"),
                version: row.get("version"),
            },
            plan,
        }))
    }

    async fn merge_violation(&self, id: ExplainId, violation: &Violation) -> Result<()> {
        let conn = self.conn().await?;
        let merged = conn
            .execute(
                MERGE_VIOLATION,
                &[
                    &id,
                    &violation.check,
                    &violation.severity,
                    &violation.at_plan,
                ],
            )
            .await
            .context("Failed to merge violation")?;
        if merged == 0 {
            bail!("no performance check named {}", violation.check);
        }
        Ok(())
    }

    async fn clear_pending_check(&self, id: ExplainId) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE explains SET pending_check = false WHERE id = $1",
            &[&id],
        )
        .await
        .context("Failed to clear pending check")?;
        Ok(())
    }

    async fn explains_to_index_check(&self, max: usize) -> Result<Vec<ExplainId>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM explains WHERE pending_index_check ORDER BY id LIMIT $1",
                &[&limit(max)],
            )
            .await
            .context("Failed to list explains to index check")?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn clear_pending_index_checks(&self, ids: &[ExplainId]) -> Result<u64> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE explains SET pending_index_check = false WHERE id = ANY($1) AND pending_index_check",
            &[&ids],
        )
        .await
        .context("Failed to clear pending index checks")
    }

    async fn merge_index_candidates(
        &self,
        id: ExplainId,
        candidates: &[IndexCandidate],
    ) -> Result<u64> {
        let mut conn = self.conn().await?;
        let tx = pg(&mut conn).transaction().await?;
        let merge = tx.prepare(MERGE_CANDIDATE).await?;
        let mut created = 0;
        for candidate in candidates {
            let label = candidate.label.as_deref().unwrap_or_default();
            let property = candidate.property.as_deref().unwrap_or_default();
            created += tx
                .execute(
                    &merge,
                    &[
                        &id,
                        &candidate.plan_node,
                        &candidate.kind.as_str(),
                        &label,
                        &property,
                    ],
                )
                .await
                .context("Failed to merge index candidate")?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn index_recommendations(&self) -> Result<Vec<IndexRecommendation>> {
        let conn = self.conn().await?;
        let rows = conn.query(INDEX_RECOMMENDATIONS, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| IndexRecommendation {
                label: row.get("label"),
                property: row.get("property"),
                count: row.get("count"),
            })
            .collect())
    }

    async fn latest_stats(&self) -> Result<Vec<LatestStat>> {
        let conn = self.conn().await?;
        let rows = conn.query(LATEST_STATS, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| LatestStat {
                has_violation: row.get("has_violation"),
                has_index: row.get("has_index"),
                count: row.get("count"),
            })
            .collect())
    }

    async fn daily_counts(&self) -> Result<Vec<DailyCount>> {
        let conn = self.conn().await?;
        let rows = conn.query(DAILY_COUNTS, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| DailyCount {
                date: row.get("date"),
                query_logs: row.get("query_logs"),
                explains: row.get("explains"),
                with_violations: row.get("with_violations"),
            })
            .collect())
    }
}
