//! Statement ingestion: dedup by content hash and lifecycle updates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::db::{PlanStore, QueryLog, Upsert};
use crate::hash::statement_id;

/// Record that `text` was seen in the workload.
pub async fn record_sighting(
    store: &dyn PlanStore,
    text: &str,
    observed_at: DateTime<Utc>,
) -> Result<Upsert> {
    let id = statement_id(text);
    store
        .record_sighting(&id, text, observed_at)
        .await
        .with_context(|| format!("Failed to record sighting of {}", id))
}

/// Record that the engine reported the cached plan of `text` as stale.
pub async fn record_stale(
    store: &dyn PlanStore,
    text: &str,
    observed_at: DateTime<Utc>,
    explain_now: bool,
) -> Result<Upsert> {
    let id = statement_id(text);
    store
        .record_stale(&id, text, observed_at, explain_now)
        .await
        .with_context(|| format!("Failed to record stale plan of {}", id))
}

/// One line of the ingest stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestEvent {
    pub query: String,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub stale: bool,
    /// Execution metrics of this run, saved as a query log at `observed_at`.
    #[serde(default)]
    pub log: Option<QueryLog>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub events: usize,
    pub created: usize,
    pub logs: usize,
    pub rejected: usize,
}

/// Save the execution record of one run of `text`.
pub async fn record_query_log(
    store: &dyn PlanStore,
    text: &str,
    logged_at: DateTime<Utc>,
    log: &QueryLog,
) -> Result<()> {
    let id = statement_id(text);
    store
        .record_query_log(&id, logged_at, log)
        .await
        .with_context(|| format!("Failed to save query log of {}", id))
}

/// Apply JSON-lines events from `reader` until end of input.
///
/// Malformed lines and failed writes are logged and counted, never fatal.
pub async fn ingest_lines<R>(
    store: &dyn PlanStore,
    reader: R,
    explain_stale_now: bool,
) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IngestSummary::default();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: IngestEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed event");
                summary.rejected += 1;
                continue;
            }
        };

        let result = if event.stale {
            record_stale(store, &event.query, event.observed_at, explain_stale_now).await
        } else {
            record_sighting(store, &event.query, event.observed_at).await
        };
        match result {
            Ok(upsert) => {
                summary.events += 1;
                if upsert.created {
                    summary.created += 1;
                }
                debug!(line = line_no, state = %upsert.state, created = upsert.created, "ingested");
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "could not ingest event");
                summary.rejected += 1;
                continue;
            }
        }

        if let Some(log) = &event.log {
            match record_query_log(store, &event.query, event.observed_at, log).await {
                Ok(()) => summary.logs += 1,
                Err(e) => warn!(line = line_no, error = %e, "could not save query log"),
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StatementState};
    use crate::plan::{CapturedPlan, PlanNode, ServerInfo};
    use crate::serializer::serialize;
    use chrono::Duration;

    const QUERY: &str = "MATCH (n:Person) RETURN n";

    async fn explain(store: &MemoryStore, text: &str) {
        let graph = serialize(&CapturedPlan {
            plan: PlanNode::new("ProduceResults").with_child(PlanNode::new("AllNodesScan")),
            server: ServerInfo::default(),
        });
        store
            .persist_plan(&statement_id(text), &graph)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_sighting_only_refreshes_last_log_time() {
        let store = MemoryStore::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(30);

        let first = record_sighting(&store, QUERY, t1).await.unwrap();
        assert!(first.created);
        assert_eq!(first.state, StatementState::PendingExplain);

        // formatting differences hash to the same statement
        let second = record_sighting(&store, "match (n:Person)\n  return n", t2)
            .await
            .unwrap();
        assert!(!second.created);

        let statement = store.statement(&statement_id(QUERY)).await.unwrap().unwrap();
        assert_eq!(statement.text, QUERY);
        assert_eq!(statement.last_log_time, t2);
        assert_eq!(statement.state, StatementState::PendingExplain);
    }

    #[tokio::test]
    async fn test_explained_statement_is_not_re_explained() {
        let store = MemoryStore::new();
        record_sighting(&store, QUERY, Utc::now()).await.unwrap();
        explain(&store, QUERY).await;

        let upsert = record_sighting(&store, QUERY, Utc::now()).await.unwrap();
        assert_eq!(upsert.state, StatementState::Explained);
        assert!(store.statements_to_explain(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_then_sighting_requeues() {
        let store = MemoryStore::new();
        record_sighting(&store, QUERY, Utc::now()).await.unwrap();
        explain(&store, QUERY).await;

        let stale = record_stale(&store, QUERY, Utc::now(), false).await.unwrap();
        assert_eq!(stale.state, StatementState::Stale);
        assert!(store.statements_to_explain(10).await.unwrap().is_empty());

        let seen = record_sighting(&store, QUERY, Utc::now()).await.unwrap();
        assert_eq!(seen.state, StatementState::PendingExplain);
        assert_eq!(store.statements_to_explain(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_with_explain_now_requeues_immediately() {
        let store = MemoryStore::new();
        let created = record_stale(&store, QUERY, Utc::now(), true).await.unwrap();
        assert!(created.created);
        assert_eq!(created.state, StatementState::PendingExplain);
    }

    #[tokio::test]
    async fn test_unexplainable_is_terminal() {
        let store = MemoryStore::new();
        record_sighting(&store, QUERY, Utc::now()).await.unwrap();
        store.mark_unexplainable(&statement_id(QUERY)).await.unwrap();

        for stale in [false, true] {
            let upsert = if stale {
                record_stale(&store, QUERY, Utc::now(), true).await.unwrap()
            } else {
                record_sighting(&store, QUERY, Utc::now()).await.unwrap()
            };
            assert_eq!(upsert.state, StatementState::Unexplainable);
        }
    }

    #[tokio::test]
    async fn test_ingest_lines() {
        let store = MemoryStore::new();
        let input = concat!(
            r#"{"query": "MATCH (n) RETURN n", "observed_at": "2024-05-01T10:00:00Z"}"#,
            "\n\n",
            r#"{"query": "MATCH (n) RETURN n", "observed_at": "2024-05-01T10:05:00Z"}"#,
            "\n",
            "not json\n",
            r#"{"query": "RETURN 1", "stale": true}"#,
            "\n",
        );

        let summary = ingest_lines(&store, input.as_bytes(), false).await.unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                events: 3,
                created: 2,
                logs: 0,
                rejected: 1
            }
        );

        let statement = store
            .statement(&statement_id("MATCH (n) RETURN n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(statement.last_log_time.to_rfc3339(), "2024-05-01T10:05:00+00:00");
        let stale = store.statement(&statement_id("RETURN 1")).await.unwrap().unwrap();
        assert_eq!(stale.state, StatementState::Stale);
    }

    #[tokio::test]
    async fn test_ingest_saves_query_logs() {
        let store = MemoryStore::new();
        let input = concat!(
            r#"{"query": "MATCH (n) RETURN n", "observed_at": "2024-05-01T10:00:00Z", "#,
            r#""log": {"query_time_ms": 42, "page_hits": 7, "user": "neo4j", "client": "10.0.0.5:51234"}}"#,
            "\n",
            r#"{"query": "MATCH (n) RETURN n", "observed_at": "2024-05-02T09:00:00Z", "log": {"cpu_ms": 3}}"#,
            "\n",
        );

        let summary = ingest_lines(&store, input.as_bytes(), false).await.unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.logs, 2);

        let logs = store.query_logs(&statement_id("MATCH (n) RETURN n"));
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].query_time_ms, Some(42));
        assert_eq!(logs[0].user.as_deref(), Some("neo4j"));
        assert_eq!(logs[1].cpu_ms, Some(3));

        let days = store.daily_counts().await.unwrap();
        assert_eq!(days.iter().map(|d| d.query_logs).collect::<Vec<_>>(), vec![1, 1]);
    }
}
