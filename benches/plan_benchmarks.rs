//! Benchmarks for the per-statement hot paths.
//!
//! Benchmarks cover:
//! - statement identity hashing
//! - plan serialization (plan tree → write set)
//! - EXPLAIN (FORMAT JSON) conversion
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use planwatch::capture::plan_from_pg_json;
use planwatch::hash::statement_id;
use planwatch::plan::{CapturedPlan, PlanNode, ServerInfo};
use planwatch::serializer::serialize;

const SHORT_QUERY: &str = "MATCH (n:Person) WHERE n.age > 30 RETURN n";

const LONG_QUERY: &str = "// nightly import\n\
    USING PERIODIC COMMIT 500\n\
    LOAD CSV WITH HEADERS FROM 'file:///people.csv' AS row\n\
    MERGE (p:Person {id: toInteger(row.id)})\n\
    ON CREATE SET p.name = row.name, p.age = toInteger(row.age)\n\
    WITH p, row\n\
    MATCH (c:City {name: row.city}) // city must exist\n\
    MERGE (p)-[:LIVES_IN]->(c)";

const PG_EXPLAIN: &str = r#"[{"Plan": {
    "Node Type": "Sort", "Plan Rows": 100, "Sort Key": ["p.age"],
    "Plans": [{
        "Node Type": "Hash Join", "Join Type": "Inner", "Hash Cond": "(p.city_id = c.id)",
        "Plans": [
            {"Node Type": "Seq Scan", "Relation Name": "person", "Alias": "p", "Filter": "(age > 30)"},
            {"Node Type": "Hash", "Plans": [
                {"Node Type": "Index Scan", "Relation Name": "city", "Alias": "c", "Index Name": "city_pkey"}
            ]}
        ]
    }]
}}]"#;

/// A left-deep plan with `depth` filter/expand levels.
fn deep_plan(depth: usize) -> CapturedPlan {
    let mut node = PlanNode::new("NodeByLabelScan")
        .with_identifiers(&["n0"])
        .with_argument("LabelName", ":Person")
        .with_argument("EstimatedRows", 1000.0);
    for i in 1..=depth {
        let ident = format!("n{}", i);
        node = PlanNode::new("Filter")
            .with_argument("ExpressionString", format!("n{}.age > {}", i - 1, i))
            .with_child(
                PlanNode::new("Expand(All)")
                    .with_identifiers(&[ident.as_str()])
                    .with_child(node),
            );
    }
    CapturedPlan {
        plan: PlanNode::new("ProduceResults")
            .with_argument("planner", "COST")
            .with_argument("runtime", "PIPELINED")
            .with_child(node),
        server: ServerInfo::default(),
    }
}

fn bench_statement_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("statement_id");
    for (name, query) in [("short", SHORT_QUERY), ("long", LONG_QUERY)] {
        group.bench_with_input(BenchmarkId::new("hash", name), query, |b, query| {
            b.iter(|| statement_id(black_box(query)));
        });
    }
    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");
    for depth in [4, 32, 256] {
        let plan = deep_plan(depth);
        group.bench_with_input(BenchmarkId::new("plan", depth), &plan, |b, plan| {
            b.iter(|| serialize(black_box(plan)));
        });
    }
    group.finish();
}

fn bench_pg_explain(c: &mut Criterion) {
    let output: serde_json::Value = serde_json::from_str(PG_EXPLAIN).expect("valid JSON");
    c.bench_function("pg_explain_json", |b| {
        b.iter(|| plan_from_pg_json(black_box(&output)));
    });
}

criterion_group!(benches, bench_statement_id, bench_serialize, bench_pg_explain);
criterion_main!(benches);
