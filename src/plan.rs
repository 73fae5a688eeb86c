use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One operator of a captured plan, as handed over by a capture engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub operator_type: String,
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    #[serde(default)]
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn new(operator_type: impl Into<String>) -> Self {
        Self {
            operator_type: operator_type.into(),
            identifiers: Vec::new(),
            arguments: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_identifiers(mut self, identifiers: &[&str]) -> Self {
        self.identifiers = identifiers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    pub fn with_child(mut self, child: PlanNode) -> Self {
        self.children.push(child);
        self
    }

    /// Number of operators in this subtree, including this one.
    pub fn operator_count(&self) -> usize {
        1 + self.children.iter().map(PlanNode::operator_count).sum::<usize>()
    }
}

/// Address and version of the server that produced a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Output of a capture engine for one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedPlan {
    pub plan: PlanNode,
    #[serde(default)]
    pub server: ServerInfo,
}

/// Engine/runtime metadata stored on an explain snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub server_address: Option<String>,
    pub server_version: Option<String>,
    pub planner: Option<String>,
    pub planner_impl: Option<String>,
    pub planner_version: Option<String>,
    pub runtime: Option<String>,
    pub runtime_impl: Option<String>,
    pub runtime_version: Option<String>,
    pub version: Option<String>,
}

impl SnapshotMetadata {
    /// Slot for a hoisted plan argument, if `key` is a planner/runtime key.
    pub fn slot_mut(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            "planner" => Some(&mut self.planner),
            "planner-impl" => Some(&mut self.planner_impl),
            "planner-version" => Some(&mut self.planner_version),
            "runtime" => Some(&mut self.runtime),
            "runtime-impl" => Some(&mut self.runtime_impl),
            "runtime-version" => Some(&mut self.runtime_version),
            "version" => Some(&mut self.version),
            _ => None,
        }
    }
}

/// A persisted plan operator, addressed by index inside a [`PlanTree`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPlanNode {
    pub id: i64,
    pub alias: i32,
    pub operator_type: String,
    pub identifiers: Vec<String>,
    pub arguments: BTreeMap<String, Value>,
    pub children: Vec<usize>,
}

impl StoredPlanNode {
    pub fn argument_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Arena view of a persisted plan, rebuilt from nodes and HAS_CHILD edges.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanTree {
    pub nodes: Vec<StoredPlanNode>,
    pub root: usize,
}

impl PlanTree {
    /// Build a tree from loose nodes and (parent id, child id) edges.
    ///
    /// Children keep alias order. The root is the single node nobody points at.
    pub fn from_parts(mut nodes: Vec<StoredPlanNode>, edges: &[(i64, i64)]) -> Option<Self> {
        nodes.sort_by_key(|n| n.alias);
        let index: BTreeMap<i64, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        let mut has_parent = vec![false; nodes.len()];

        for (parent, child) in edges {
            let (Some(&p), Some(&c)) = (index.get(parent), index.get(child)) else {
                continue;
            };
            nodes[p].children.push(c);
            has_parent[c] = true;
        }
        for node in &mut nodes {
            node.children.sort_unstable();
        }

        let mut roots = has_parent.iter().enumerate().filter(|(_, p)| !**p);
        let root = roots.next()?.0;
        if roots.next().is_some() {
            return None;
        }
        Some(Self { nodes, root })
    }

    pub fn node(&self, idx: usize) -> &StoredPlanNode {
        &self.nodes[idx]
    }

    pub fn root_node(&self) -> &StoredPlanNode {
        &self.nodes[self.root]
    }

    /// All nodes strictly below `idx`, with their distance from it, in depth-first order.
    pub fn descendants_with_depth(&self, idx: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, usize)> = self.nodes[idx]
            .children
            .iter()
            .rev()
            .map(|&c| (c, 1))
            .collect();
        while let Some((current, depth)) = stack.pop() {
            out.push((current, depth));
            for &child in self.nodes[current].children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }

    /// All nodes strictly below `idx`.
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        self.descendants_with_depth(idx)
            .into_iter()
            .map(|(i, _)| i)
            .collect()
    }
}
