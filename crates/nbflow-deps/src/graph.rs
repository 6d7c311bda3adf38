use crate::analyzer::Analysis;
use nbflow_core::CellId;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("circular dependency between cells: {}", format_cells(.cells))]
    CycleDetected { cells: Vec<CellId> },
}

fn format_cells(cells: &[CellId]) -> String {
    cells
        .iter()
        .map(CellId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Producer -> consumer edges between cells, resolved with last-definer-wins
/// in document order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraphMap<CellId, ()>,
    positions: HashMap<CellId, usize>,
    definers: BTreeMap<String, CellId>,
}

impl DependencyGraph {
    pub fn rebuild<'a, I>(cells: I) -> Self
    where
        I: IntoIterator<Item = (CellId, &'a Analysis)>,
    {
        let cells = cells.into_iter().collect::<Vec<_>>();
        let mut graph = DiGraphMap::with_capacity(cells.len(), cells.len());
        let mut positions = HashMap::with_capacity(cells.len());
        let mut definers = BTreeMap::new();

        for (position, (id, analysis)) in cells.iter().enumerate() {
            graph.add_node(*id);
            positions.insert(*id, position);
            for symbol in &analysis.defined {
                definers.insert(symbol.clone(), *id);
            }
        }

        for (consumer, analysis) in &cells {
            for symbol in analysis.external_reads() {
                if let Some(producer) = definers.get(symbol) {
                    if producer != consumer {
                        graph.add_edge(*producer, *consumer, ());
                    }
                }
            }
        }

        Self {
            graph,
            positions,
            definers,
        }
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.graph.contains_node(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn definer_of(&self, symbol: &str) -> Option<CellId> {
        self.definers.get(symbol).copied()
    }

    pub fn has_edge(&self, producer: CellId, consumer: CellId) -> bool {
        self.graph.contains_edge(producer, consumer)
    }

    pub fn edges(&self) -> Vec<(CellId, CellId)> {
        let mut edges = self
            .graph
            .all_edges()
            .map(|(producer, consumer, _)| (producer, consumer))
            .collect::<Vec<_>>();
        edges.sort_by_key(|(producer, consumer)| (self.position(*producer), self.position(*consumer)));
        edges
    }

    /// Cells transitively reachable from `id`, excluding `id` itself unless
    /// it sits on a cycle.
    pub fn descendants(&self, id: CellId) -> HashSet<CellId> {
        let mut reached = HashSet::new();
        if !self.contains(id) {
            return reached;
        }
        for start in self.graph.neighbors_directed(id, Direction::Outgoing) {
            if reached.contains(&start) {
                continue;
            }
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(node) = bfs.next(&self.graph) {
                reached.insert(node);
            }
        }
        reached
    }

    /// Kahn's algorithm over the whole graph or the subgraph induced by
    /// `subset`; ready cells are released in document order.
    pub fn topological_order(
        &self,
        subset: Option<&HashSet<CellId>>,
    ) -> Result<Vec<CellId>, GraphError> {
        let included = |id: &CellId| subset.map_or(true, |cells| cells.contains(id));
        let nodes = self.graph.nodes().filter(included).collect::<Vec<_>>();

        let mut indegree = HashMap::with_capacity(nodes.len());
        let mut ready = BinaryHeap::new();
        for node in &nodes {
            let count = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .filter(included)
                .count();
            if count == 0 {
                ready.push(Reverse((self.position(*node), *node)));
            }
            indegree.insert(*node, count);
        }

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(node);
            for consumer in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let Some(remaining) = indegree.get_mut(&consumer) else {
                    continue;
                };
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push(Reverse((self.position(consumer), consumer)));
                }
            }
        }

        if order.len() < nodes.len() {
            let placed = order.iter().copied().collect::<HashSet<_>>();
            let stuck = nodes
                .into_iter()
                .filter(|node| !placed.contains(node))
                .collect::<HashSet<_>>();
            return Err(GraphError::CycleDetected {
                cells: self.cycle_members(&stuck),
            });
        }
        Ok(order)
    }

    fn cycle_members(&self, stuck: &HashSet<CellId>) -> Vec<CellId> {
        let mut members = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .flatten()
            .filter(|id| stuck.contains(id))
            .collect::<Vec<_>>();
        if members.is_empty() {
            members = stuck.iter().copied().collect();
        }
        members.sort_by_key(|id| self.position(*id));
        members
    }

    fn position(&self, id: CellId) -> usize {
        self.positions.get(&id).copied().unwrap_or(usize::MAX)
    }
}
