//! Bipartite DAG of operation and data nodes.
//!
//! Every node input adds a `data -> operation` edge, every output an
//! `operation -> data` edge. The operations/data projections contract edges
//! through the opposite kind. The execution stack groups operations into
//! layers whose inputs are fully satisfied by earlier layers; stalled
//! progress before all operations are consumed reveals a cycle.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::model::{value_data_names, DagModel, NodeModel};
use crate::error::{PipelimeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Operation { name: String, model: NodeModel },
    Data { name: String },
}

impl GraphNode {
    pub fn name(&self) -> &str {
        match self {
            GraphNode::Operation { name, .. } => name,
            GraphNode::Data { name } => name,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, GraphNode::Data { .. })
    }
}

#[derive(Debug, Default)]
pub struct DagGraph {
    graph: DiGraph<GraphNode, ()>,
    operations: BTreeMap<String, NodeIndex>,
    data: BTreeMap<String, NodeIndex>,
}

impl DagGraph {
    pub fn build(model: &DagModel) -> DagGraph {
        let mut dag = DagGraph::default();
        for (name, node) in &model.nodes {
            let op_idx = dag.graph.add_node(GraphNode::Operation {
                name: name.clone(),
                model: node.clone(),
            });
            dag.operations.insert(name.clone(), op_idx);
        }
        for (name, node) in &model.nodes {
            let op_idx = dag.operations[name];
            for value in node.inputs.values() {
                for data_name in value_data_names(value) {
                    let data_idx = dag.data_index(&data_name);
                    dag.graph.update_edge(data_idx, op_idx, ());
                }
            }
            for value in node.outputs.values() {
                for data_name in value_data_names(value) {
                    let data_idx = dag.data_index(&data_name);
                    dag.graph.update_edge(op_idx, data_idx, ());
                }
            }
        }
        dag
    }

    fn data_index(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.data.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(GraphNode::Data {
            name: name.to_string(),
        });
        self.data.insert(name.to_string(), idx);
        idx
    }

    pub fn raw_graph(&self) -> &DiGraph<GraphNode, ()> {
        &self.graph
    }

    pub fn operation(&self, name: &str) -> Option<&NodeModel> {
        let idx = self.operations.get(name)?;
        match &self.graph[*idx] {
            GraphNode::Operation { model, .. } => Some(model),
            GraphNode::Data { .. } => None,
        }
    }

    pub fn operation_names(&self) -> impl Iterator<Item = &String> {
        self.operations.keys()
    }

    pub fn data_names(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Data nodes with no producer: the external inputs of the DAG.
    pub fn root_data_nodes(&self) -> BTreeSet<String> {
        self.data
            .iter()
            .filter(|(_, idx)| {
                self.graph
                    .neighbors_directed(**idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Data nodes with no consumer: the produced artifacts.
    pub fn leaf_data_nodes(&self) -> BTreeSet<String> {
        self.data
            .iter()
            .filter(|(_, idx)| {
                self.graph
                    .neighbors_directed(**idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Projection onto one node kind, contracting edges through the other:
    /// `data: false` yields the operations-graph, `data: true` the
    /// data-graph.
    pub fn project(&self, data: bool) -> DiGraph<String, ()> {
        let mut projected = DiGraph::new();
        let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();
        let source_map = if data { &self.data } else { &self.operations };
        for name in source_map.keys() {
            index.insert(name.clone(), projected.add_node(name.clone()));
        }
        // Walk the contracted kind and connect its neighbors directly.
        for through_idx in self.graph.node_indices() {
            let through = &self.graph[through_idx];
            if through.is_data() == data {
                continue;
            }
            let preds: Vec<_> = self
                .graph
                .neighbors_directed(through_idx, Direction::Incoming)
                .collect();
            let succs: Vec<_> = self
                .graph
                .neighbors_directed(through_idx, Direction::Outgoing)
                .collect();
            for pred in &preds {
                for succ in &succs {
                    let from = index[self.graph[*pred].name()];
                    let to = index[self.graph[*succ].name()];
                    projected.update_edge(from, to, ());
                }
            }
        }
        projected
    }

    pub fn operations_graph(&self) -> DiGraph<String, ()> {
        self.project(false)
    }

    pub fn data_graph(&self) -> DiGraph<String, ()> {
        self.project(true)
    }

    /// Layered execution order: each layer holds the operations whose input
    /// data nodes are all satisfied by previous layers. Stalled progress
    /// before every operation is consumed is a cyclic configuration.
    pub fn build_execution_stack(&self) -> Result<Vec<Vec<String>>> {
        let mut produced: BTreeSet<String> = self.root_data_nodes();
        let mut consumed: BTreeSet<String> = BTreeSet::new();
        let mut stack = Vec::new();
        loop {
            let mut layer: Vec<String> = Vec::new();
            for (name, op_idx) in &self.operations {
                if consumed.contains(name) {
                    continue;
                }
                let ready = self
                    .graph
                    .neighbors_directed(*op_idx, Direction::Incoming)
                    .all(|pred| produced.contains(self.graph[pred].name()));
                if ready {
                    layer.push(name.clone());
                }
            }
            if layer.is_empty() {
                break;
            }
            for name in &layer {
                consumed.insert(name.clone());
                for succ in self
                    .graph
                    .neighbors_directed(self.operations[name], Direction::Outgoing)
                {
                    produced.insert(self.graph[succ].name().to_string());
                }
            }
            stack.push(layer);
        }
        if consumed.len() != self.operations.len() {
            let stalled: Vec<&String> = self
                .operations
                .keys()
                .filter(|name| !consumed.contains(*name))
                .collect();
            return Err(PipelimeError::Layout(format!(
                "cycle in operations graph, stalled nodes: {stalled:?}"
            )));
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::parser::{DagConfig, parse_dag};
    use serde_json::json;

    fn graph_of(nodes: serde_json::Value) -> DagGraph {
        let config = DagConfig::from_value(&json!({"nodes": nodes})).unwrap();
        DagGraph::build(&parse_dag(&config).unwrap())
    }

    #[test]
    fn roots_and_leaves() {
        let dag = graph_of(json!({
            "first": {"command": "proc", "inputs": {"src": "raw"}, "outputs": {"dst": "mid"}},
            "second": {"command": "proc", "inputs": {"src": "mid"}, "outputs": {"dst": "out"}},
        }));
        assert_eq!(dag.root_data_nodes(), BTreeSet::from(["raw".to_string()]));
        assert_eq!(dag.leaf_data_nodes(), BTreeSet::from(["out".to_string()]));
    }

    #[test]
    fn execution_stack_layers_respect_dependencies() {
        let dag = graph_of(json!({
            "a": {"command": "proc", "inputs": {"src": "raw"}, "outputs": {"dst": "mid_a"}},
            "b": {"command": "proc", "inputs": {"src": "raw"}, "outputs": {"dst": "mid_b"}},
            "join": {
                "command": "proc",
                "inputs": {"left": "mid_a", "right": "mid_b"},
                "outputs": {"dst": "out"}
            },
        }));
        let stack = dag.build_execution_stack().unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stack[1], vec!["join".to_string()]);
    }

    #[test]
    fn cycle_is_detected_as_stalled_progress() {
        let dag = graph_of(json!({
            "a": {"command": "proc", "inputs": {"src": "x"}, "outputs": {"dst": "y"}},
            "b": {"command": "proc", "inputs": {"src": "y"}, "outputs": {"dst": "x"}},
        }));
        assert!(dag.build_execution_stack().is_err());
    }

    #[test]
    fn operations_graph_contracts_data_nodes() {
        let dag = graph_of(json!({
            "first": {"command": "proc", "inputs": {"src": "raw"}, "outputs": {"dst": "mid"}},
            "second": {"command": "proc", "inputs": {"src": "mid"}, "outputs": {"dst": "out"}},
        }));
        let ops = dag.operations_graph();
        assert_eq!(ops.node_count(), 2);
        assert_eq!(ops.edge_count(), 1);
    }
}
