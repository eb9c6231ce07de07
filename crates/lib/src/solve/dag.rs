//! Execution DAG over the nodes of a definition.
//!
//! Waves group nodes whose dependencies all sit in earlier waves, so every
//! node of a wave can run in parallel.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::definition::Definition;
use crate::util::hash::Digest;

use super::SolveError;

pub struct ExecutionDag {
  graph: DiGraph<Digest, ()>,
  nodes: HashMap<Digest, NodeIndex>,
}

impl ExecutionDag {
  /// Build the DAG of every node reachable from the definition's root.
  ///
  /// Nodes that nothing in the root's closure depends on are left out.
  pub fn from_definition(definition: &Definition) -> Result<Self, SolveError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    let closure = definition.closure();
    for digest in &closure {
      let idx = graph.add_node(digest.clone());
      nodes.insert(digest.clone(), idx);
    }

    for digest in &closure {
      let def = definition
        .get(digest)
        .ok_or_else(|| SolveError::UnknownNode(digest.clone()))?;
      let dependent_idx = nodes[digest];

      let mut seen = HashSet::new();
      for input in &def.inputs {
        if !seen.insert(&input.digest) {
          continue;
        }
        let dep_idx = *nodes
          .get(&input.digest)
          .ok_or_else(|| SolveError::UnknownNode(input.digest.clone()))?;
        // Edge from dependency to dependent
        graph.add_edge(dep_idx, dependent_idx, ());
      }
    }

    let dag = Self { graph, nodes };
    toposort(&dag.graph, None).map_err(|_| SolveError::CycleDetected)?;
    Ok(dag)
  }

  /// Nodes organized into parallel execution waves, each sorted by digest.
  pub fn waves(&self) -> Result<Vec<Vec<Digest>>, SolveError> {
    // Kahn's algorithm, one level at a time
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();

      if ready.is_empty() {
        return Err(SolveError::CycleDetected);
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<Digest> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }

  /// Direct dependencies of `digest`.
  pub fn dependencies(&self, digest: &Digest) -> Vec<Digest> {
    let Some(&idx) = self.nodes.get(digest) else {
      return Vec::new();
    };

    self
      .graph
      .neighbors_directed(idx, Direction::Incoming)
      .map(|dep_idx| self.graph[dep_idx].clone())
      .collect()
  }

  pub fn node_count(&self) -> usize {
    self.nodes.len()
  }
}
