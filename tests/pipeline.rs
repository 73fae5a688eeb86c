use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use planwatch::capture::{CaptureError, ErrorCategory, Explainer, PlanCapture};
use planwatch::db::{CandidateKind, MemoryStore, PlanStore, StatementState};
use planwatch::hash::statement_id;
use planwatch::index::IndexInferenceEngine;
use planwatch::ingest::{record_sighting, record_stale};
use planwatch::plan::{CapturedPlan, PlanNode, ServerInfo};
use planwatch::rules::{bootstrap_checks, RuleEngine, NO_CARTESIAN_PRODUCT};
use planwatch::scheduler::{tick, Intervals, PollState};

const PERSON_AGE: &str = "MATCH (n:Person) WHERE n.age > 30 RETURN n";
const CARTESIAN: &str = "MATCH (a:Person), (b:Movie) RETURN a, b";
const BROKEN: &str = "MATCH (n RETURN n";

/// Graph engine stand-in keyed by normalized statement id.
struct Engine {
    plans: HashMap<String, PlanNode>,
}

impl Engine {
    fn new() -> Self {
        let mut plans = HashMap::new();
        plans.insert(
            statement_id(PERSON_AGE),
            PlanNode::new("ProduceResults")
                .with_identifiers(&["n"])
                .with_argument("planner", "COST")
                .with_argument("runtime", "PIPELINED")
                .with_argument("version", "CYPHER 5")
                .with_child(
                    PlanNode::new("Filter")
                        .with_identifiers(&["n"])
                        .with_argument("Details", "n.age > $autoint_0")
                        .with_argument("EstimatedRows", 3.3)
                        .with_child(
                            PlanNode::new("NodeByLabelScan")
                                .with_identifiers(&["n"])
                                .with_argument("Details", "n:Person")
                                .with_argument("EstimatedRows", 10.0),
                        ),
                ),
        );
        plans.insert(
            statement_id(CARTESIAN),
            PlanNode::new("ProduceResults").with_child(
                PlanNode::new("CartesianProduct")
                    .with_child(PlanNode::new("NodeByLabelScan").with_identifiers(&["a"]))
                    .with_child(PlanNode::new("NodeByLabelScan").with_identifiers(&["b"])),
            ),
        );
        Self { plans }
    }
}

#[async_trait]
impl PlanCapture for Engine {
    fn name(&self) -> &str {
        "engine"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn capture(&self, text: &str) -> Result<CapturedPlan, CaptureError> {
        match self.plans.get(&statement_id(text)) {
            Some(plan) => Ok(CapturedPlan {
                plan: plan.clone(),
                server: ServerInfo {
                    address: Some("graph:7687".to_string()),
                    version: Some("5.20.0".to_string()),
                },
            }),
            None => Err(CaptureError::unexplainable(ErrorCategory::Syntax, "Invalid input")),
        }
    }
}

#[tokio::test]
async fn test_full_pipeline() {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn PlanStore> = store.clone();
    bootstrap_checks(store.as_ref(), &[]).await.unwrap();

    let explainer = Explainer::new(dyn_store.clone(), Arc::new(Engine::new()), 10);
    let rules = RuleEngine::new(dyn_store.clone(), 10);
    let index = IndexInferenceEngine::new(dyn_store.clone(), 30);
    let intervals = Intervals::default();

    for text in [PERSON_AGE, CARTESIAN, BROKEN, "match (n:Person)\nwhere n.age > 30 // adults\nreturn n"] {
        record_sighting(store.as_ref(), text, Utc::now()).await.unwrap();
    }

    // explain: three distinct statements, then nothing
    assert_eq!(tick(&explainer, &intervals).await, PollState::Draining);
    assert_eq!(tick(&explainer, &intervals).await, PollState::Idle(intervals.idle));

    let broken = store.statement(&statement_id(BROKEN)).await.unwrap().unwrap();
    assert_eq!(broken.state, StatementState::Unexplainable);
    assert_eq!(store.explain_ids().len(), 2);

    // rules
    assert_eq!(tick(&rules, &intervals).await, PollState::Draining);
    assert_eq!(tick(&rules, &intervals).await, PollState::Idle(intervals.idle));

    // index inference
    assert_eq!(tick(&index, &intervals).await, PollState::Draining);
    assert_eq!(tick(&index, &intervals).await, PollState::Idle(intervals.idle));

    let mut person = None;
    let mut cartesian = None;
    for id in store.explain_ids() {
        let snapshot = store.load_snapshot(id).await.unwrap().unwrap();
        if snapshot.statement_text == PERSON_AGE {
            assert_eq!(snapshot.metadata.planner.as_deref(), Some("COST"));
            assert_eq!(snapshot.metadata.runtime.as_deref(), Some("PIPELINED"));
            assert_eq!(snapshot.metadata.server_version.as_deref(), Some("5.20.0"));
            assert!(snapshot.plan.root_node().arguments.get("planner").is_none());
            person = Some(id);
        } else {
            cartesian = Some(id);
        }
    }
    let (person, cartesian) = (person.unwrap(), cartesian.unwrap());

    assert!(store.violations(person).is_empty());
    let violations = store.violations(cartesian);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].check, NO_CARTESIAN_PRODUCT);
    assert_eq!(violations[0].severity, 5);

    let candidates = store.index_candidates(person);
    assert_eq!(candidates.len(), 2);
    assert!(candidates
        .iter()
        .any(|c| c.kind == CandidateKind::Property && c.property.as_deref() == Some("age")));
    assert!(candidates
        .iter()
        .all(|c| c.label.as_deref() == Some("Person")));

    let recommendations = store.index_recommendations().await.unwrap();
    assert_eq!(recommendations.len(), 1);
    assert_eq!(recommendations[0].property, "age");

    let latest = store.latest_stats().await.unwrap();
    assert_eq!(latest.iter().map(|s| s.count).sum::<i64>(), 2);
    assert!(latest.iter().any(|s| s.has_violation && !s.has_index));
    assert!(latest.iter().any(|s| !s.has_violation && s.has_index));
}

#[tokio::test]
async fn test_stale_plan_is_recaptured() {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn PlanStore> = store.clone();
    let explainer = Explainer::new(dyn_store, Arc::new(Engine::new()), 10);

    record_sighting(store.as_ref(), PERSON_AGE, Utc::now()).await.unwrap();
    explainer.explain_pending().await.unwrap();

    // a re-sighting of an explained statement changes nothing
    record_sighting(store.as_ref(), PERSON_AGE, Utc::now()).await.unwrap();
    assert_eq!(explainer.explain_pending().await.unwrap(), 0);

    record_stale(store.as_ref(), PERSON_AGE, Utc::now(), false).await.unwrap();
    assert_eq!(explainer.explain_pending().await.unwrap(), 0);

    record_sighting(store.as_ref(), PERSON_AGE, Utc::now()).await.unwrap();
    assert_eq!(explainer.explain_pending().await.unwrap(), 1);
    assert_eq!(store.explain_ids().len(), 2);

    let latest = store.latest_stats().await.unwrap();
    assert_eq!(latest.iter().map(|s| s.count).sum::<i64>(), 1);
}

#[tokio::test]
async fn test_filter_over_all_nodes_scan_recommends_statement_label() {
    let text = "// note\nMATCH (n:Person) WHERE n.age > 30 RETURN n";
    let mut plans = HashMap::new();
    plans.insert(
        statement_id(text),
        PlanNode::new("Filter")
            .with_identifiers(&["n"])
            .with_argument("ExpressionString", "n.age > 30")
            .with_child(PlanNode::new("AllNodesScan").with_identifiers(&["n"])),
    );

    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn PlanStore> = store.clone();
    let explainer = Explainer::new(dyn_store.clone(), Arc::new(Engine { plans }), 10);
    let index = IndexInferenceEngine::new(dyn_store, 30);

    record_sighting(store.as_ref(), text, Utc::now()).await.unwrap();
    // the comment does not change the statement identity
    assert_eq!(statement_id(text), statement_id(PERSON_AGE));
    assert_eq!(explainer.explain_pending().await.unwrap(), 1);
    assert_eq!(index.drain().await.unwrap().processed, 1);

    let id = store.explain_ids()[0];
    let candidates = store.index_candidates(id);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].kind, CandidateKind::Property);

    let recommendations = store.index_recommendations().await.unwrap();
    assert_eq!(recommendations.len(), 1);
    assert_eq!(recommendations[0].label.as_deref(), Some("Person"));
    assert_eq!(recommendations[0].property, "age");
    assert_eq!(recommendations[0].count, 1);
}
