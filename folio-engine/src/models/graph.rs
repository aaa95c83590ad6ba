//! Engine graphs: the DAG of generation steps an execution walks
//!
//! Nodes with no dependency between them may run in parallel; an edge
//! `source -> target` means the target needs the source's output. Layered
//! topological order is computed once per execution and drives the worker.

use folio_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What a node does when the worker reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry node; emits the caller's input as context
    Input,
    /// One generation call producing a single block of prose
    AiGeneration,
    /// Sequential chapter-by-chapter generation
    MultiChapterGeneration,
    /// Generation used as context (outlines, research), never as chapters
    Process,
    /// Terminal marker; reaching it triggers manuscript compilation
    Output,
}

/// One step in an engine graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Prompt template; upstream outputs and continuity context are appended
    #[serde(default)]
    pub prompt: Option<String>,
    /// Chapter count for multi-chapter nodes
    #[serde(default)]
    pub chapters: Option<u32>,
}

/// Directed dependency between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
}

/// A validated node/edge graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl EngineGraph {
    /// Build a graph, rejecting duplicate ids, dangling edges, and cycles
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<Self> {
        let graph = Self { nodes, edges };
        graph.validate()?;
        Ok(graph)
    }

    /// Structural validation; cycle detection happens via the layer walk
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::InvalidInput("graph has no nodes".to_string()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "edge references unknown source node: {}",
                    edge.source
                )));
            }
            if !ids.contains(edge.target.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "edge references unknown target node: {}",
                    edge.target
                )));
            }
        }

        self.topological_layers()?;
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids each node feeds into
    pub fn adjacency(&self) -> HashMap<&str, Vec<&str>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            adjacency.entry(node.id.as_str()).or_default();
        }
        for edge in &self.edges {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
        adjacency
    }

    /// Node ids each node depends on
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Kahn layering: each layer's nodes are mutually independent and may
    /// run in parallel; layers run in order
    pub fn topological_layers(&self) -> Result<Vec<Vec<&GraphNode>>> {
        let adjacency = self.adjacency();
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), 0))
            .collect();
        for edge in &self.edges {
            if let Some(count) = indegree.get_mut(edge.target.as_str()) {
                *count += 1;
            }
        }

        let mut layers: Vec<Vec<&GraphNode>> = Vec::new();
        let mut ready: Vec<&str> = {
            // Preserve declaration order within a layer
            let mut r: Vec<&str> = self
                .nodes
                .iter()
                .filter(|n| indegree[n.id.as_str()] == 0)
                .map(|n| n.id.as_str())
                .collect();
            r.reverse();
            r
        };
        let mut visited = 0usize;

        while !ready.is_empty() {
            let mut layer_ids: Vec<&str> = Vec::new();
            while let Some(id) = ready.pop() {
                layer_ids.push(id);
            }
            let mut next_ready: Vec<&str> = Vec::new();
            for id in &layer_ids {
                visited += 1;
                for downstream in adjacency.get(id).into_iter().flatten() {
                    let count = indegree
                        .get_mut(downstream)
                        .ok_or_else(|| Error::Internal("indegree index out of sync".to_string()))?;
                    *count -= 1;
                    if *count == 0 {
                        next_ready.push(downstream);
                    }
                }
            }
            layers.push(
                layer_ids
                    .iter()
                    .filter_map(|id| self.node(id))
                    .collect(),
            );
            next_ready.reverse();
            ready = next_ready;
        }

        if visited != self.nodes.len() {
            return Err(Error::InvalidInput(
                "graph contains a cycle".to_string(),
            ));
        }
        Ok(layers)
    }
}
