//! DAG domain model.
//!
//! A validated graph of block definitions wired by port-to-port edges.
//! Construction goes through the DAG parser, which guarantees the invariants
//! relied on here: ids are unique, edge endpoints exist, the graph is
//! acyclic, and each (to-block, input-port) pair has at most one edge.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::block::BlockDef;

/// Directed wiring from one block's output port to another's input port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from_block: String,
    pub from_port: String,
    pub to_block: String,
    pub to_port: String,
    /// Optional transform expression evaluated with `{value}` in scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// A parsed, validated DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub name: String,
    pub blocks: HashMap<String, BlockDef>,
    pub edges: Vec<Edge>,
    /// Blocks with no incoming edges (unless overridden by the config).
    pub entrypoints: Vec<String>,
    /// Blocks with no outgoing edges (unless overridden by the config).
    pub terminals: Vec<String>,
}

impl Dag {
    pub fn block(&self, id: &str) -> Option<&BlockDef> {
        self.blocks.get(id)
    }

    /// All edges feeding the given block.
    pub fn edges_into<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.to_block == block_id)
    }

    /// All edges leaving the given block.
    pub fn edges_from<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from_block == block_id)
    }

    /// The at-most-one edge feeding a specific input port.
    pub fn incoming_edge(&self, block_id: &str, port: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.to_block == block_id && e.to_port == port)
    }

    /// Block ids with no incoming edges, sorted.
    pub fn compute_entrypoints(&self) -> Vec<String> {
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.to_block.as_str()).collect();
        let mut ids: Vec<String> = self
            .blocks
            .keys()
            .filter(|id| !targets.contains(id.as_str()))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Block ids with no outgoing edges, sorted.
    pub fn compute_terminals(&self) -> Vec<String> {
        let sources: HashSet<&str> = self.edges.iter().map(|e| e.from_block.as_str()).collect();
        let mut ids: Vec<String> = self
            .blocks
            .keys()
            .filter(|id| !sources.contains(id.as_str()))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Kahn's topological sort over (blocks, edges).
    ///
    /// `Err` carries the blocks left unordered (the cycle participants),
    /// sorted for stable error messages.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.blocks.keys().map(|id| (id.as_str(), 0)).collect();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &self.edges {
            // Parallel edges between the same pair of blocks count once.
            let succ = successors.entry(edge.from_block.as_str()).or_default();
            if !succ.contains(&edge.to_block.as_str()) {
                succ.push(edge.to_block.as_str());
                if let Some(degree) = in_degree.get_mut(edge.to_block.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = {
            let mut roots: Vec<&str> = in_degree
                .iter()
                .filter(|&(_, &deg)| deg == 0)
                .map(|(id, _)| *id)
                .collect();
            roots.sort_unstable();
            roots.into()
        };

        let mut order = Vec::with_capacity(self.blocks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(succ) = successors.get(id) {
                for next in succ {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if order.len() == self.blocks.len() {
            Ok(order)
        } else {
            let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
            let mut remaining: Vec<String> = self
                .blocks
                .keys()
                .filter(|id| !ordered.contains(id.as_str()))
                .cloned()
                .collect();
            remaining.sort();
            Err(remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::block::{
        AgentRef, BlockMode, GateComposition, RetryPolicy,
    };
    use std::collections::HashMap;

    fn block(id: &str) -> BlockDef {
        BlockDef {
            id: id.to_string(),
            name: id.to_string(),
            mode: BlockMode::Ai,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            agent: AgentRef::default(),
            deterministic: None,
            pre_gates: vec![],
            post_gates: vec![],
            gate_composition: GateComposition::default(),
            on_gate_fail: vec![],
            retry: RetryPolicy::default(),
            approval: None,
            timeout_ms: None,
            strict_output: true,
            contract_repair_attempts: 1,
        }
    }

    fn edge(from: &str, to: &str) -> Edge {
        Edge {
            from_block: from.to_string(),
            from_port: "out".to_string(),
            to_block: to.to_string(),
            to_port: "in".to_string(),
            transform: None,
        }
    }

    fn dag(ids: &[&str], edges: Vec<Edge>) -> Dag {
        Dag {
            name: "test".to_string(),
            blocks: ids.iter().map(|id| ((*id).to_string(), block(id))).collect(),
            edges,
            entrypoints: vec![],
            terminals: vec![],
        }
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let d = dag(&["a", "b", "c"], vec![edge("a", "b"), edge("b", "c")]);
        let order = d.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_cycle_reports_participants() {
        let d = dag(
            &["a", "b", "c"],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
        );
        let remaining = d.topological_order().unwrap_err();
        assert_eq!(remaining, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_entrypoints_and_terminals() {
        let d = dag(&["a", "b", "c"], vec![edge("a", "b"), edge("a", "c")]);
        assert_eq!(d.compute_entrypoints(), vec!["a"]);
        assert_eq!(d.compute_terminals(), vec!["b", "c"]);
    }

    #[test]
    fn test_parallel_edges_count_once() {
        let mut e2 = edge("a", "b");
        e2.to_port = "in2".to_string();
        let d = dag(&["a", "b"], vec![edge("a", "b"), e2]);
        assert!(d.topological_order().is_ok());
    }
}
