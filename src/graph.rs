//! C2 — Dependency Graph: edges, cycle detection with path reporting,
//! topological levels, critical path and parallel-group analysis.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::config::CycleResolution;
use crate::errors::{QueueError, Result};
use crate::types::{DependencyEdge, DependencyKind, TaskId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub has_cycles: bool,
    pub cycles: Vec<Vec<TaskId>>,
    pub levels: Vec<Vec<TaskId>>,
    pub critical_path: Vec<TaskId>,
    pub parallel_groups: Vec<Vec<TaskId>>,
    pub estimated_duration: chrono::Duration,
}

/// Per-task facts the graph needs from the store to analyze duration and
/// resources without owning task data itself (I8: store is the source of truth).
#[derive(Debug, Clone)]
pub struct TaskFacts {
    pub estimated_duration: chrono::Duration,
    pub required_resources: HashSet<String>,
    pub is_pending: bool,
}

pub struct DependencyGraph {
    graph: DiGraph<TaskId, DependencyEdge>,
    node_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index: HashMap::new(),
        }
    }

    pub fn ensure_node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&idx) = self.node_index.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.node_index.insert(id.clone(), idx);
        idx
    }

    pub fn remove_node(&mut self, id: &TaskId) {
        if let Some(idx) = self.node_index.remove(id) {
            self.graph.remove_node(idx);
        }
    }

    /// Adds an edge, validating both endpoints are known nodes. If the edge
    /// is blocking and would close a cycle, the edge is rolled back and
    /// `CycleIntroduced` is returned with the offending path.
    pub fn add_edge(&mut self, edge: DependencyEdge, resolution: CycleResolution) -> Result<()> {
        if !self.node_index.contains_key(&edge.dependent) {
            return Err(QueueError::InvalidInput(format!(
                "unknown dependent task {}",
                edge.dependent
            )));
        }
        if !self.node_index.contains_key(&edge.depends_on) {
            return Err(QueueError::InvalidInput(format!(
                "unknown dependency task {}",
                edge.depends_on
            )));
        }

        if !edge.kind.blocks_scheduling() {
            self.insert_edge(edge);
            return Ok(());
        }

        let from = self.node_index[&edge.dependent];
        let to = self.node_index[&edge.depends_on];
        let edge_idx = self.graph.add_edge(from, to, edge.clone());

        if let Some(cycle) = self.find_cycle_through(to) {
            match resolution {
                CycleResolution::Strict => {
                    self.graph.remove_edge(edge_idx);
                    return Err(QueueError::CycleIntroduced { cycle });
                }
                CycleResolution::BestEffort | CycleResolution::ParallelOptimized => {
                    // Caller (scheduler layer) decides which edge to drop/downgrade;
                    // here we just surface the cycle and leave the edge inserted
                    // so the resolver can inspect and act on it.
                    return Err(QueueError::CycleIntroduced { cycle });
                }
            }
        }
        Ok(())
    }

    fn insert_edge(&mut self, edge: DependencyEdge) {
        let from = self.node_index[&edge.dependent];
        let to = self.node_index[&edge.depends_on];
        self.graph.add_edge(from, to, edge);
    }

    /// Inserts an edge without cycle validation, used by the caller-side
    /// cycle resolver when downgrading a `hard` edge to `soft` (a
    /// non-blocking kind, so it cannot reintroduce a blocking cycle).
    pub fn insert_downgraded(&mut self, edge: DependencyEdge) {
        debug_assert!(!edge.kind.blocks_scheduling());
        if self.node_index.contains_key(&edge.dependent) && self.node_index.contains_key(&edge.depends_on) {
            self.insert_edge(edge);
        }
    }

    pub fn remove_edge(&mut self, dependent: &TaskId, depends_on: &TaskId) {
        let (Some(&from), Some(&to)) = (self.node_index.get(dependent), self.node_index.get(depends_on)) else {
            return;
        };
        if let Some(edge_idx) = self.graph.find_edge(from, to) {
            self.graph.remove_edge(edge_idx);
        }
    }

    /// DFS white/gray/black coloring from `start`, returning the first cycle
    /// found that passes through `start`, as an ordered id path.
    fn find_cycle_through(&self, start: NodeIndex) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: HashMap<NodeIndex, Color> = self
            .graph
            .node_indices()
            .map(|n| (n, Color::White))
            .collect();
        let mut path = Vec::new();

        fn visit(
            graph: &DiGraph<TaskId, DependencyEdge>,
            node: NodeIndex,
            color: &mut HashMap<NodeIndex, Color>,
            path: &mut Vec<NodeIndex>,
        ) -> Option<Vec<NodeIndex>> {
            color.insert(node, Color::Gray);
            path.push(node);
            for edge in graph.edges_directed(node, Direction::Outgoing) {
                if !edge.weight().kind.blocks_scheduling() {
                    continue;
                }
                let next = edge.target();
                match color[&next] {
                    Color::White => {
                        if let Some(cycle) = visit(graph, next, color, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Gray => {
                        let start_pos = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<NodeIndex> = path[start_pos..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            }
            path.pop();
            color.insert(node, Color::Black);
            None
        }

        let cycle_nodes = visit(&self.graph, start, &mut color, &mut path)?;
        Some(
            cycle_nodes
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect(),
        )
    }

    fn first_cycle(&self) -> Option<Vec<TaskId>> {
        for node in self.graph.node_indices() {
            if let Some(cycle) = self.find_cycle_through(node) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn's algorithm restricted to blocking edges, producing level→ids.
    fn levels(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for node in self.graph.node_indices() {
            let degree = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .filter(|e| e.weight().kind.blocks_scheduling())
                .count();
            in_degree.insert(node, degree);
        }

        let mut levels = Vec::new();
        let mut remaining = in_degree.clone();
        let mut settled: HashSet<NodeIndex> = HashSet::new();

        while settled.len() < self.graph.node_count() {
            let ready: Vec<NodeIndex> = remaining
                .iter()
                .filter(|(n, &deg)| deg == 0 && !settled.contains(*n))
                .map(|(&n, _)| n)
                .collect();
            if ready.is_empty() {
                break; // remaining nodes are inside a cycle; stop here
            }
            let mut level_ids: Vec<TaskId> = ready.iter().map(|&n| self.graph[n].clone()).collect();
            level_ids.sort();
            levels.push(level_ids);

            for &node in &ready {
                settled.insert(node);
                remaining.remove(&node);
            }
            // Decrement in-degree of predecessors (edges point dependent -> dependsOn,
            // so a node that just "settled" as a dependency frees its dependents).
            for node in self.graph.node_indices() {
                if settled.contains(&node) {
                    continue;
                }
                let deg = self
                    .graph
                    .edges_directed(node, Direction::Outgoing)
                    .filter(|e| e.weight().kind.blocks_scheduling() && ready.contains(&e.target()))
                    .count();
                if let Some(entry) = remaining.get_mut(&node) {
                    *entry = entry.saturating_sub(deg);
                }
            }
        }
        levels
    }

    /// Longest-duration path through the blocking-edge DAG, by per-task
    /// `estimatedDuration` supplied by the caller as node weights.
    fn critical_path(&self, facts: &HashMap<TaskId, TaskFacts>) -> Vec<TaskId> {
        let levels = self.levels();
        let order: Vec<NodeIndex> = levels
            .iter()
            .flatten()
            .filter_map(|id| self.node_index.get(id).copied())
            .collect();

        let mut best_duration: HashMap<NodeIndex, chrono::Duration> = HashMap::new();
        let mut best_predecessor: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for &node in &order {
            let id = &self.graph[node];
            let own_duration = facts
                .get(id)
                .map(|f| f.estimated_duration)
                .unwrap_or_else(|| chrono::Duration::zero());

            let mut best = own_duration;
            let mut predecessor = None;
            for edge in self.graph.edges_directed(node, Direction::Incoming) {
                if !edge.weight().kind.blocks_scheduling() {
                    continue;
                }
                let source = edge.source();
                if let Some(&accumulated) = best_duration.get(&source) {
                    let candidate = accumulated + own_duration;
                    if candidate > best {
                        best = candidate;
                        predecessor = Some(source);
                    }
                }
            }
            best_duration.insert(node, best);
            if let Some(pred) = predecessor {
                best_predecessor.insert(node, pred);
            }
        }

        let Some((&end, _)) = best_duration.iter().max_by_key(|(_, d)| **d) else {
            return Vec::new();
        };

        let mut path = vec![end];
        let mut current = end;
        while let Some(&pred) = best_predecessor.get(&current) {
            path.push(pred);
            current = pred;
        }
        path.reverse();
        path.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// Greedy grouping within a level: start a new group when a task's
    /// resources intersect the current group's union.
    fn parallel_groups(&self, levels: &[Vec<TaskId>], facts: &HashMap<TaskId, TaskFacts>) -> Vec<Vec<TaskId>> {
        let mut groups = Vec::new();
        for level in levels {
            let mut current_group: Vec<TaskId> = Vec::new();
            let mut used_resources: HashSet<String> = HashSet::new();
            for id in level {
                let resources = facts.get(id).map(|f| f.required_resources.clone()).unwrap_or_default();
                let conflicts = !resources.is_disjoint(&used_resources);
                if conflicts && !current_group.is_empty() {
                    groups.push(std::mem::take(&mut current_group));
                    used_resources.clear();
                }
                used_resources.extend(resources);
                current_group.push(id.clone());
            }
            if !current_group.is_empty() {
                groups.push(current_group);
            }
        }
        groups
    }

    pub fn analyze(&self, facts: &HashMap<TaskId, TaskFacts>) -> GraphAnalysis {
        let cycle = self.first_cycle();
        let levels = self.levels();
        let critical_path = self.critical_path(facts);
        let parallel_groups = self.parallel_groups(&levels, facts);
        let estimated_duration = levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|id| facts.get(id).map(|f| f.estimated_duration))
                    .max()
                    .unwrap_or_else(chrono::Duration::zero)
            })
            .fold(chrono::Duration::zero(), |acc, d| acc + d);

        GraphAnalysis {
            has_cycles: cycle.is_some(),
            cycles: cycle.into_iter().collect(),
            levels,
            critical_path,
            parallel_groups,
            estimated_duration,
        }
    }

    /// Pending tasks with every blocking dependency satisfied, ordered by
    /// (topological level asc). Final priority ordering is the Scheduler's job.
    pub fn ready(&self, facts: &HashMap<TaskId, TaskFacts>) -> Vec<TaskId> {
        let levels = self.levels();
        let mut ready = Vec::new();
        for level in &levels {
            for id in level {
                let Some(fact) = facts.get(id) else { continue };
                if !fact.is_pending {
                    continue;
                }
                let Some(&node) = self.node_index.get(id) else { continue };
                let all_deps_done = self
                    .graph
                    .edges_directed(node, Direction::Outgoing)
                    .filter(|e| e.weight().kind.blocks_scheduling())
                    .all(|e| {
                        let dep_id = &self.graph[e.target()];
                        facts.get(dep_id).map_or(false, |f| !f.is_pending)
                    });
                if all_deps_done {
                    ready.push(id.clone());
                }
            }
        }
        ready
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&node) = self.node_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| self.graph[e.source()].clone())
            .collect()
    }

    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&node) = self.node_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| self.graph[e.target()].clone())
            .collect()
    }

    /// BFS over blocking edges; used to find the lowest-combined-priority
    /// edge to drop under `bestEffort` resolution.
    pub fn edges_in_cycle(&self, cycle: &[TaskId]) -> Vec<(TaskId, TaskId)> {
        let mut edges = Vec::new();
        for window in cycle.windows(2) {
            edges.push((window[0].clone(), window[1].clone()));
        }
        edges
    }

    #[allow(dead_code)]
    fn bfs_reachable(&self, from: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                queue.push_back(edge.target());
            }
        }
        seen
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(duration_minutes: i64) -> TaskFacts {
        TaskFacts {
            estimated_duration: chrono::Duration::minutes(duration_minutes),
            required_resources: HashSet::new(),
            is_pending: true,
        }
    }

    #[test]
    fn linear_chain_has_three_levels() {
        let mut graph = DependencyGraph::new();
        let a = TaskId::from("a");
        let b = TaskId::from("b");
        let c = TaskId::from("c");
        for id in [&a, &b, &c] {
            graph.ensure_node(id);
        }
        graph
            .add_edge(DependencyEdge::new(b.clone(), a.clone(), DependencyKind::Hard), CycleResolution::Strict)
            .unwrap();
        graph
            .add_edge(DependencyEdge::new(c.clone(), b.clone(), DependencyKind::Hard), CycleResolution::Strict)
            .unwrap();

        let facts: HashMap<TaskId, TaskFacts> = [(a, facts(5)), (b, facts(5)), (c, facts(5))].into_iter().collect();
        let analysis = graph.analyze(&facts);
        assert!(!analysis.has_cycles);
        assert_eq!(analysis.levels.len(), 3);
    }

    #[test]
    fn cycle_is_rejected_under_strict_resolution() {
        let mut graph = DependencyGraph::new();
        let a = TaskId::from("a");
        let b = TaskId::from("b");
        graph.ensure_node(&a);
        graph.ensure_node(&b);
        graph
            .add_edge(DependencyEdge::new(a.clone(), b.clone(), DependencyKind::Hard), CycleResolution::Strict)
            .unwrap();
        let err = graph
            .add_edge(DependencyEdge::new(b.clone(), a.clone(), DependencyKind::Hard), CycleResolution::Strict)
            .unwrap_err();
        assert!(matches!(err, QueueError::CycleIntroduced { .. }));
    }

    #[test]
    fn ready_set_excludes_blocked_dependents() {
        let mut graph = DependencyGraph::new();
        let a = TaskId::from("a");
        let b = TaskId::from("b");
        graph.ensure_node(&a);
        graph.ensure_node(&b);
        graph
            .add_edge(DependencyEdge::new(b.clone(), a.clone(), DependencyKind::Hard), CycleResolution::Strict)
            .unwrap();

        let mut facts: HashMap<TaskId, TaskFacts> = HashMap::new();
        facts.insert(a.clone(), facts_pending(true));
        facts.insert(b.clone(), facts_pending(true));

        let ready = graph.ready(&facts);
        assert_eq!(ready, vec![a]);
    }

    fn facts_pending(pending: bool) -> TaskFacts {
        TaskFacts {
            estimated_duration: chrono::Duration::minutes(1),
            required_resources: HashSet::new(),
            is_pending: pending,
        }
    }

    proptest::proptest! {
        #[test]
        fn strict_resolution_never_leaves_a_cycle(edges in proptest::collection::vec((0usize..6, 0usize..6), 0..20)) {
            let mut graph = DependencyGraph::new();
            let ids: Vec<TaskId> = (0..6).map(|i| TaskId::from(format!("n{i}"))).collect();
            for id in &ids {
                graph.ensure_node(id);
            }
            for (from, to) in edges {
                if from == to {
                    continue;
                }
                let edge = DependencyEdge::new(ids[from].clone(), ids[to].clone(), DependencyKind::Hard);
                let _ = graph.add_edge(edge, CycleResolution::Strict);
            }
            proptest::prop_assert!(graph.first_cycle().is_none());
        }

        #[test]
        fn dependents_and_dependencies_stay_symmetric(edges in proptest::collection::vec((0usize..6, 0usize..6), 0..20)) {
            let mut graph = DependencyGraph::new();
            let ids: Vec<TaskId> = (0..6).map(|i| TaskId::from(format!("n{i}"))).collect();
            for id in &ids {
                graph.ensure_node(id);
            }
            for (from, to) in edges {
                if from == to {
                    continue;
                }
                let edge = DependencyEdge::new(ids[from].clone(), ids[to].clone(), DependencyKind::Hard);
                let _ = graph.add_edge(edge, CycleResolution::Strict);
            }
            for a in &ids {
                for b in &ids {
                    let a_depends_on_b = graph.dependencies(a).contains(b);
                    let b_has_a_as_dependent = graph.dependents(b).contains(a);
                    proptest::prop_assert_eq!(a_depends_on_b, b_has_a_as_dependent);
                }
            }
        }
    }
}
