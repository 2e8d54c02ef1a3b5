//! Typed DAG model.
//!
//! The parser expands a raw configuration into this model; the graph and
//! executor consume it. Field validation failures carry the node path so a
//! bad configuration points at the offending entry.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelimeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeModel {
    pub command: String,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Optional per-port sample-schema files validated by the executor.
    #[serde(default)]
    pub input_schemas: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub output_schemas: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DagModel {
    pub nodes: BTreeMap<String, NodeModel>,
}

impl DagModel {
    /// Validate an expanded nodes mapping into the typed model.
    pub fn from_nodes_value(nodes: &Value) -> Result<DagModel> {
        let Value::Object(map) = nodes else {
            return Err(PipelimeError::config(
                "nodes",
                "the nodes section must be a mapping",
            ));
        };
        let mut out = BTreeMap::new();
        for (name, spec) in map {
            let node: NodeModel = serde_json::from_value(spec.clone()).map_err(|err| {
                PipelimeError::config(format!("nodes.{name}"), err.to_string())
            })?;
            out.insert(name.clone(), node);
        }
        Ok(DagModel { nodes: out })
    }
}

/// Normalize a port value into the data-node names it references: a string
/// names one data node, a list names one per element, nested lists (fused
/// tuples) and other scalars are stringified.
pub fn value_data_names(value: &Value) -> Vec<String> {
    fn scalar_name(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    match value {
        Value::Array(items) => items.iter().map(scalar_name).collect(),
        other => vec![scalar_name(other)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_command_reports_the_node_path() {
        let nodes = json!({"detector": {"inputs": {"src": "a"}}});
        let err = DagModel::from_nodes_value(&nodes).unwrap_err();
        assert!(err.to_string().contains("nodes.detector"));
    }

    #[test]
    fn data_names_normalize_strings_and_lists() {
        assert_eq!(value_data_names(&json!("a")), vec!["a".to_string()]);
        assert_eq!(
            value_data_names(&json!(["a", "b"])),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
