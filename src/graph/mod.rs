//! Schema Reference Graph
//!
//! A split schema is a DAG of `SchemaNode`s held in a petgraph `DiGraph`.
//! Edges point from a dependent node to the node it references, so a
//! registration order is any order that visits targets before sources.
//!
//! The graph also tracks references to types that already live in the
//! registry (external references), which resolve without a node.

pub mod walk;

pub use walk::{collect_definitions, walk_mut, Definition, DocumentNames, SchemaVisitor, Visit};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Result, SchemaError};
use crate::schema::{RegisteredReference, SchemaNode};

// ============================================================================
// Dependency ordering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Visiting,
    Done,
}

fn sorted_successors<N, E, K, F>(graph: &DiGraph<N, E>, node: NodeIndex, key: &F) -> Vec<NodeIndex>
where
    F: Fn(&N) -> K,
    K: Ord,
{
    let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    next.sort_by(|a, b| key(&graph[*a]).cmp(&key(&graph[*b])));
    next.dedup();
    next
}

/// Order the nodes of `graph` so every edge target comes before its source.
///
/// Nodes are grouped by height (leaves first) and ties are broken by `key`,
/// which makes the order deterministic for a given graph. On a cycle the
/// offending path is returned as `Err`, starting and ending at the same node.
pub fn dependency_order<N, E, K, F>(graph: &DiGraph<N, E>, key: F) -> std::result::Result<Vec<NodeIndex>, Vec<NodeIndex>>
where
    F: Fn(&N) -> K,
    K: Ord,
{
    let count = graph.node_count();
    let mut marks = vec![Mark::New; count];
    let mut height = vec![0usize; count];

    let mut starts: Vec<NodeIndex> = graph.node_indices().collect();
    starts.sort_by(|a, b| key(&graph[*a]).cmp(&key(&graph[*b])));

    for start in starts {
        if marks[start.index()] != Mark::New {
            continue;
        }
        marks[start.index()] = Mark::Visiting;
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
            vec![(start, sorted_successors(graph, start, &key), 0)];

        while let Some(top) = stack.last_mut() {
            let next = if top.2 < top.1.len() {
                top.2 += 1;
                Some(top.1[top.2 - 1])
            } else {
                None
            };

            match next {
                Some(next) => match marks[next.index()] {
                    Mark::New => {
                        marks[next.index()] = Mark::Visiting;
                        let successors = sorted_successors(graph, next, &key);
                        stack.push((next, successors, 0));
                    }
                    Mark::Visiting => {
                        let mut cycle: Vec<NodeIndex> = stack
                            .iter()
                            .map(|(node, _, _)| *node)
                            .skip_while(|node| *node != next)
                            .collect();
                        cycle.push(next);
                        return Err(cycle);
                    }
                    Mark::Done => {}
                },
                None => {
                    if let Some((node, successors, _)) = stack.pop() {
                        height[node.index()] = successors
                            .iter()
                            .map(|s| height[s.index()] + 1)
                            .max()
                            .unwrap_or(0);
                        marks[node.index()] = Mark::Done;
                    }
                }
            }
        }
    }

    let mut order: Vec<NodeIndex> = graph.node_indices().collect();
    order.sort_by(|a, b| {
        height[a.index()]
            .cmp(&height[b.index()])
            .then_with(|| key(&graph[*a]).cmp(&key(&graph[*b])))
    });
    Ok(order)
}

// ============================================================================
// SchemaGraph
// ============================================================================

/// The result of splitting one schema: a root node and the nodes it references
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    graph: DiGraph<SchemaNode, ()>,
    /// fullname -> node
    index: HashMap<String, NodeIndex>,
    root: NodeIndex,
    /// Types already registered elsewhere, by fullname
    external: BTreeMap<String, RegisteredReference>,
}

impl SchemaGraph {
    /// Build a graph from a root node and its dependencies.
    ///
    /// Every name in a node's `references` must be another node or an external
    /// reference. Fails with `CyclicReference` if the nodes do not form a DAG.
    pub fn from_nodes(
        root: SchemaNode,
        nodes: Vec<SchemaNode>,
        external: Vec<RegisteredReference>,
    ) -> Result<Self> {
        let mut root = root;
        root.is_root = true;

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let root_fullname = root.fullname.clone();
        let root_idx = graph.add_node(root);
        index.insert(root_fullname, root_idx);

        for mut node in nodes {
            node.is_root = false;
            if let Some(&existing) = index.get(&node.fullname) {
                if graph[existing].text != node.text {
                    return Err(SchemaError::ConflictingDefinition {
                        fullname: node.fullname,
                    });
                }
                continue;
            }
            let fullname = node.fullname.clone();
            let idx = graph.add_node(node);
            index.insert(fullname, idx);
        }

        let mut this = Self {
            graph,
            index,
            root: root_idx,
            external: external
                .into_iter()
                .map(|reference| (reference.name.clone(), reference))
                .collect(),
        };
        this.link()?;
        this.registration_indices()?;
        Ok(this)
    }

    fn link(&mut self) -> Result<()> {
        let mut edges = Vec::new();
        for source in self.graph.node_indices() {
            let node = &self.graph[source];
            for name in &node.references {
                match self.index.get(name) {
                    Some(&target) if target != source => edges.push((source, target)),
                    Some(_) => {}
                    None if self.external.contains_key(name) => {}
                    None => {
                        return Err(SchemaError::UnresolvedReference { name: name.clone() });
                    }
                }
            }
        }
        for (source, target) in edges {
            self.graph.update_edge(source, target, ());
        }
        Ok(())
    }

    fn registration_indices(&self) -> Result<Vec<NodeIndex>> {
        dependency_order(&self.graph, |node: &SchemaNode| node.fullname.clone()).map_err(|cycle| {
            SchemaError::CyclicReference {
                cycle: cycle
                    .into_iter()
                    .map(|idx| self.graph[idx].fullname.clone())
                    .collect(),
            }
        })
    }

    // ========== Public API ==========

    pub fn root(&self) -> &SchemaNode {
        &self.graph[self.root]
    }

    pub fn root_mut(&mut self) -> &mut SchemaNode {
        &mut self.graph[self.root]
    }

    pub fn get(&self, fullname: &str) -> Option<&SchemaNode> {
        self.index.get(fullname).map(|&idx| &self.graph[idx])
    }

    pub fn get_mut(&mut self, fullname: &str) -> Option<&mut SchemaNode> {
        match self.index.get(fullname) {
            Some(&idx) => Some(&mut self.graph[idx]),
            None => None,
        }
    }

    pub fn contains(&self, fullname: &str) -> bool {
        self.index.contains_key(fullname)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes, in insertion order (root first)
    pub fn nodes(&self) -> impl Iterator<Item = &SchemaNode> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// References to types registered outside this graph
    pub fn external_references(&self) -> impl Iterator<Item = &RegisteredReference> {
        self.external.values()
    }

    pub fn external_reference(&self, fullname: &str) -> Option<&RegisteredReference> {
        self.external.get(fullname)
    }

    /// Nodes in the order they must be registered: dependencies first, root last
    pub fn registration_order(&self) -> Vec<&SchemaNode> {
        // Acyclicity was checked in `from_nodes`.
        self.registration_indices()
            .unwrap_or_default()
            .into_iter()
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Immediate dependencies of a node
    pub fn refs_out(&self, fullname: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(fullname) else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| self.graph[e.target()].fullname.as_str())
            .collect();
        out.sort();
        out
    }

    /// Immediate dependents of a node
    pub fn refs_in(&self, fullname: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(fullname) else {
            return Vec::new();
        };
        let mut incoming: Vec<&str> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| self.graph[e.source()].fullname.as_str())
            .collect();
        incoming.sort();
        incoming
    }

    /// Transitive dependencies of a node, excluding the node itself
    pub fn closure(&self, fullname: &str) -> Vec<&SchemaNode> {
        let Some(&start) = self.index.get(fullname) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        let mut result = Vec::new();
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            if idx != start {
                result.push(&self.graph[idx]);
            }
            stack.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));
        }
        result.sort_by(|a, b| a.fullname.cmp(&b.fullname));
        result
    }

    /// Export the reference graph to GraphViz DOT format
    pub fn to_dot(&self) -> String {
        let mut output = String::new();

        output.push_str("digraph SchemaGraph {\n");
        output.push_str("  rankdir=LR;\n");
        output.push_str("  node [shape=box, style=\"filled,rounded\", fontname=\"Helvetica\", fontsize=10];\n");
        output.push_str("  edge [fontname=\"Helvetica\", fontsize=8];\n");
        output.push('\n');

        let dot_id = |fullname: &str| fullname.replace(['.', '-'], "_");

        for node in self.registration_order() {
            let color = if node.is_root { "#2196F3" } else { "#4CAF50" };
            output.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{} bytes\", fillcolor=\"{}\"];\n",
                dot_id(&node.fullname),
                node.short_name(),
                node.size(),
                color
            ));
        }
        for reference in self.external.values() {
            output.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{} v{}\", fillcolor=\"#9E9E9E\"];\n",
                dot_id(&reference.name),
                crate::schema::short_name(&reference.name),
                reference.subject,
                reference.version
            ));
        }

        output.push('\n');

        let mut edges: Vec<(String, String)> = Vec::new();
        for node in self.nodes() {
            for name in &node.references {
                if name != &node.fullname {
                    edges.push((dot_id(&node.fullname), dot_id(name)));
                }
            }
        }
        edges.sort();
        edges.dedup();
        for (source, target) in edges {
            output.push_str(&format!("  \"{}\" -> \"{}\";\n", source, target));
        }

        output.push_str("}\n");
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(fullname: &str, references: &[&str]) -> SchemaNode {
        let short = crate::schema::short_name(fullname);
        SchemaNode::new(
            fullname,
            json!({"type": "record", "name": short, "namespace": crate::schema::namespace_of(fullname), "fields": []}),
            references.iter().map(|r| r.to_string()).collect(),
        )
    }

    fn order_graph() -> SchemaGraph {
        SchemaGraph::from_nodes(
            node("com.example.events.Order", &["com.example.types.Customer", "com.example.types.Money"]),
            vec![
                node("com.example.types.Money", &[]),
                node("com.example.types.Customer", &["com.example.types.Address"]),
                node("com.example.types.Address", &[]),
            ],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_registration_order() {
        let graph = order_graph();
        let order: Vec<_> = graph
            .registration_order()
            .into_iter()
            .map(|n| n.short_name().to_string())
            .collect();
        assert_eq!(order, vec!["Address", "Money", "Customer", "Order"]);
    }

    #[test]
    fn test_root_is_last_and_flagged() {
        let graph = order_graph();
        let order = graph.registration_order();
        assert!(order.last().unwrap().is_root);
        assert_eq!(graph.root().fullname, "com.example.events.Order");
        assert_eq!(order.iter().filter(|n| n.is_root).count(), 1);
    }

    #[test]
    fn test_refs_and_closure() {
        let graph = order_graph();
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(
            graph.refs_out("com.example.events.Order"),
            vec!["com.example.types.Customer", "com.example.types.Money"]
        );
        assert_eq!(graph.refs_in("com.example.types.Address"), vec!["com.example.types.Customer"]);
        let closure: Vec<_> = graph
            .closure("com.example.events.Order")
            .into_iter()
            .map(|n| n.short_name())
            .collect();
        assert_eq!(closure, vec!["Address", "Customer", "Money"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = SchemaGraph::from_nodes(
            node("a.Root", &["a.Left"]),
            vec![node("a.Left", &["a.Right"]), node("a.Right", &["a.Left"])],
            Vec::new(),
        )
        .unwrap_err();
        match err {
            SchemaError::CyclicReference { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a.Left".to_string()));
                assert!(cycle.contains(&"a.Right".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unresolved_reference() {
        let err = SchemaGraph::from_nodes(node("a.Root", &["a.Missing"]), Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, SchemaError::UnresolvedReference { name } if name == "a.Missing"));
    }

    #[test]
    fn test_external_reference_resolves() {
        let graph = SchemaGraph::from_nodes(
            node("a.Root", &["shared.Money"]),
            Vec::new(),
            vec![RegisteredReference::new("shared.Money", "shared.Money", 3)],
        )
        .unwrap();
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.external_reference("shared.Money").unwrap().version, 3);
    }

    #[test]
    fn test_dependency_order_is_stable() {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let c = graph.add_node("c");
        let b = graph.add_node("b");
        let a = graph.add_node("a");
        graph.add_edge(c, b, ());
        graph.add_edge(c, a, ());
        let order = dependency_order(&graph, |n| *n).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn test_to_dot() {
        let dot = order_graph().to_dot();
        assert!(dot.starts_with("digraph SchemaGraph {"));
        assert!(dot.contains("\"com_example_events_Order\" -> \"com_example_types_Money\";"));
        assert!(dot.contains("\"com_example_types_Customer\" -> \"com_example_types_Address\";"));
    }
}
