//! Plan tree to graph write set.
//!
//! The walk hands out aliases in visit order (a node takes its alias before
//! any of its children) and emits a node only after its whole subtree. The
//! root therefore holds alias 0 and is the last node in [`PlanGraph::nodes`].
//! Stores create nodes in emission order, so this ordering must not change.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::plan::{CapturedPlan, PlanNode, SnapshotMetadata};

/// Plan arguments copied onto persisted plan nodes.
pub const NODE_ARGUMENTS: &[&str] = &[
    "EstimatedRows",
    "Details",
    "ExpressionString",
    "LegacyExpression",
    "LabelName",
    "KeyNames",
    "Index",
    "Order",
];

/// Plan arguments hoisted onto the explain snapshot instead.
pub const SNAPSHOT_ARGUMENTS: &[&str] = &[
    "version",
    "planner",
    "planner-impl",
    "planner-version",
    "runtime",
    "runtime-impl",
    "runtime-version",
];

/// Node-creation write for one plan operator.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeWrite {
    pub alias: usize,
    pub operator_type: String,
    pub identifiers: Vec<String>,
    pub arguments: BTreeMap<String, Value>,
}

/// HAS_CHILD link between two aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeWrite {
    pub parent: usize,
    pub child: usize,
}

/// Everything a store needs to persist one captured plan atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanGraph {
    pub nodes: Vec<NodeWrite>,
    pub edges: Vec<EdgeWrite>,
    pub root: usize,
    pub metadata: SnapshotMetadata,
}

impl PlanGraph {
    pub fn root_write(&self) -> Option<&NodeWrite> {
        self.nodes.iter().find(|n| n.alias == self.root)
    }
}

pub fn serialize(captured: &CapturedPlan) -> PlanGraph {
    let mut metadata = SnapshotMetadata {
        server_address: captured.server.address.clone(),
        server_version: captured.server.version.clone(),
        ..SnapshotMetadata::default()
    };
    let mut nodes = Vec::with_capacity(captured.plan.operator_count());
    let mut edges = Vec::new();
    let mut next_alias = 0;

    let root = walk(
        &captured.plan,
        &mut next_alias,
        &mut nodes,
        &mut edges,
        &mut metadata,
    );

    PlanGraph {
        nodes,
        edges,
        root,
        metadata,
    }
}

fn walk(
    node: &PlanNode,
    next_alias: &mut usize,
    nodes: &mut Vec<NodeWrite>,
    edges: &mut Vec<EdgeWrite>,
    metadata: &mut SnapshotMetadata,
) -> usize {
    let alias = *next_alias;
    *next_alias += 1;

    let mut arguments = BTreeMap::new();
    for (key, value) in &node.arguments {
        if let Some(slot) = metadata.slot_mut(key) {
            if slot.is_none() {
                *slot = scalar_to_string(value);
            }
            continue;
        }
        if NODE_ARGUMENTS.contains(&key.as_str()) && (value.is_string() || value.is_number()) {
            arguments.insert(key.clone(), value.clone());
        }
    }

    let children: Vec<usize> = node
        .children
        .iter()
        .map(|child| walk(child, next_alias, nodes, edges, metadata))
        .collect();

    nodes.push(NodeWrite {
        alias,
        operator_type: node.operator_type.clone(),
        identifiers: node.identifiers.clone(),
        arguments,
    });
    edges.extend(children.into_iter().map(|child| EdgeWrite {
        parent: alias,
        child,
    }));

    alias
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
