//! Performance checks evaluated over persisted plans.
//!
//! Checks live in the store as data. Each cycle reloads them, so checks added
//! while the service runs apply to the next snapshots checked.

mod checks;
mod predicate;

pub use checks::*;
pub use predicate::*;

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{ExplainId, PerformanceCheck, PlanStore, Violation};

/// A stored check together with its parsed predicate.
struct LoadedCheck {
    check: PerformanceCheck,
    predicate: Predicate,
}

pub struct RuleEngine {
    store: Arc<dyn PlanStore>,
    batch_size: usize,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn PlanStore>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    async fn load_checks(&self) -> Result<Vec<LoadedCheck>> {
        let checks = self.store.performance_checks().await?;
        Ok(checks
            .into_iter()
            .filter_map(|check| match Predicate::parse(&check.predicate) {
                Ok(predicate) => Some(LoadedCheck { check, predicate }),
                Err(e) => {
                    warn!(check = %check.name, error = %e, "skipping check with invalid predicate");
                    None
                }
            })
            .collect())
    }

    /// Check one batch of snapshots flagged pending-check.
    ///
    /// Returns the number of snapshots processed.
    pub async fn check_pending(&self) -> Result<usize> {
        let ids = self.store.explains_to_check(self.batch_size).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let checks = self.load_checks().await?;

        for &id in &ids {
            let violations = match self.check_snapshot(id, &checks).await {
                Ok(violations) => violations,
                Err(e) => {
                    // flag stays set; retried next poll
                    warn!(explain_id = id, error = %e, "could not load snapshot");
                    continue;
                }
            };
            if let Err(e) = self.store.clear_pending_check(id).await {
                warn!(explain_id = id, error = %e, "could not clear pending check");
            } else if violations > 0 {
                info!(explain_id = id, violations, "plan violates performance checks");
            }
        }
        Ok(ids.len())
    }

    /// Evaluate every check against one snapshot and merge the violations.
    ///
    /// Fails only when the snapshot cannot be loaded. Predicate and merge
    /// failures are logged and skipped.
    async fn check_snapshot(&self, id: ExplainId, checks: &[LoadedCheck]) -> Result<usize> {
        let Some(snapshot) = self.store.load_snapshot(id).await? else {
            warn!(explain_id = id, "pending snapshot disappeared");
            return Ok(0);
        };

        let mut merged = 0;
        for loaded in checks {
            let Some(found) = loaded.predicate.evaluate(&snapshot, loaded.check.severity) else {
                continue;
            };
            debug!(explain_id = id, check = %loaded.check.name, severity = found.severity, "check matched");
            let violation = Violation {
                check: loaded.check.name.clone(),
                severity: found.severity,
                at_plan: found.at_plan,
            };
            match self.store.merge_violation(id, &violation).await {
                Ok(()) => merged += 1,
                Err(e) => {
                    warn!(explain_id = id, check = %loaded.check.name, error = %e, "could not record violation")
                }
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, FAIL_LOAD_SNAPSHOT, FAIL_MERGE_VIOLATION};
    use crate::plan::{CapturedPlan, PlanNode, ServerInfo};
    use crate::serializer::serialize;
    use chrono::Utc;

    async fn persist(store: &MemoryStore, id: &str, text: &str, plan: PlanNode) -> ExplainId {
        store.record_sighting(id, text, Utc::now()).await.unwrap();
        let graph = serialize(&CapturedPlan {
            plan,
            server: ServerInfo::default(),
        });
        store.persist_plan(id, &graph).await.unwrap().unwrap()
    }

    fn cartesian_plan(seeks: usize) -> PlanNode {
        let mut product = PlanNode::new("CartesianProduct");
        for _ in 0..seeks {
            product = product.with_child(PlanNode::new("NodeUniqueIndexSeek"));
        }
        while product.children.len() < 2 {
            product = product.with_child(PlanNode::new("AllNodesScan"));
        }
        PlanNode::new("ProduceResults").with_child(product)
    }

    async fn engine_with_defaults() -> (Arc<MemoryStore>, RuleEngine) {
        let store = Arc::new(MemoryStore::new());
        bootstrap_checks(store.as_ref(), &[]).await.unwrap();
        let engine = RuleEngine::new(store.clone(), 10);
        (store, engine)
    }

    #[tokio::test]
    async fn test_cartesian_product_severity() {
        let (store, engine) = engine_with_defaults().await;
        let plain = persist(&store, "a", "MATCH (a), (b) RETURN a, b", cartesian_plan(0)).await;
        let seeks = persist(&store, "b", "MATCH (a {id: 1}), (b {id: 2}) RETURN a, b", cartesian_plan(2)).await;

        assert_eq!(engine.check_pending().await.unwrap(), 2);

        let violations = store.violations(plain);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].check, NO_CARTESIAN_PRODUCT);
        assert_eq!(violations[0].severity, 5);
        assert_eq!(violations[0].at_plan.len(), 1);

        assert_eq!(store.violations(seeks)[0].severity, 1);
    }

    #[tokio::test]
    async fn test_periodic_commit_with_eager_operator() {
        let (store, engine) = engine_with_defaults().await;
        let plan = PlanNode::new("EmptyResult").with_child(
            PlanNode::new("Create").with_child(PlanNode::new("Sort").with_child(PlanNode::new("LoadCSV"))),
        );
        let periodic = persist(
            &store,
            "p",
            "USING PERIODIC COMMIT LOAD CSV FROM 'file:///x.csv' AS row CREATE (:N {v: row[0]})",
            plan.clone(),
        )
        .await;
        let plain = persist(&store, "q", "LOAD CSV FROM 'file:///x.csv' AS row CREATE (:N)", plan).await;

        engine.check_pending().await.unwrap();

        let violations = store.violations(periodic);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].check, NO_EAGER_WITH_PERIODIC_COMMIT);
        assert_eq!(violations[0].severity, 4);
        assert!(store.violations(plain).is_empty());
    }

    #[tokio::test]
    async fn test_pending_check_cleared_exactly_once() {
        let (store, engine) = engine_with_defaults().await;
        let clean = persist(&store, "a", "MATCH (n) RETURN n", PlanNode::new("ProduceResults")).await;
        let dirty = persist(&store, "b", "MATCH (a), (b) RETURN a, b", cartesian_plan(0)).await;

        assert_eq!(engine.check_pending().await.unwrap(), 2);
        assert_eq!(engine.check_pending().await.unwrap(), 0);

        for id in [clean, dirty] {
            assert!(!store.is_pending_check(id));
            assert_eq!(store.pending_check_clears(id), 1);
        }
    }

    #[tokio::test]
    async fn test_failures_still_clear_pending_check() {
        let (store, engine) = engine_with_defaults().await;
        store
            .create_check_if_absent(&PerformanceCheck {
                name: "broken".to_string(),
                severity: 3,
                description: String::new(),
                predicate: "not json".to_string(),
                version: 1,
            })
            .await
            .unwrap();
        let id = persist(&store, "a", "MATCH (a), (b) RETURN a, b", cartesian_plan(0)).await;

        store.fail_once(FAIL_MERGE_VIOLATION);
        assert_eq!(engine.check_pending().await.unwrap(), 1);

        assert!(store.violations(id).is_empty());
        assert!(!store.is_pending_check(id));
        assert_eq!(store.pending_check_clears(id), 1);
    }

    #[tokio::test]
    async fn test_violation_merge_is_idempotent() {
        let (store, engine) = engine_with_defaults().await;
        let id = persist(&store, "a", "MATCH (a), (b) RETURN a, b", cartesian_plan(0)).await;
        engine.check_pending().await.unwrap();

        // re-running the same check over the same snapshot keeps one edge
        let snapshot = store.load_snapshot(id).await.unwrap().unwrap();
        let checks = engine.load_checks().await.unwrap();
        assert_eq!(engine.check_snapshot(snapshot.id, &checks).await.unwrap(), 1);
        assert_eq!(store.violations(id).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_load_failure_is_retried() {
        let (store, engine) = engine_with_defaults().await;
        let id = persist(&store, "a", "MATCH (a), (b) RETURN a, b", cartesian_plan(0)).await;

        store.fail_once(FAIL_LOAD_SNAPSHOT);
        assert_eq!(engine.check_pending().await.unwrap(), 1);
        assert!(store.is_pending_check(id));
        assert!(store.violations(id).is_empty());

        assert_eq!(engine.check_pending().await.unwrap(), 1);
        assert!(!store.is_pending_check(id));
        assert_eq!(store.pending_check_clears(id), 1);
        let violations = store.violations(id);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].check, NO_CARTESIAN_PRODUCT);
    }
}
