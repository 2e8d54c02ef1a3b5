//! Naive DAG executor.
//!
//! Walks the execution stack layer by layer (sequentially within a layer),
//! building one command line per operation node and spawning it as a child
//! process with captured stdout/stderr. Inputs with a declared schema are
//! validated through the underfolder reader before the spawn, outputs after
//! a clean exit; a path is validated at most once per run. A non-zero exit
//! aborts the DAG with the captured stderr; later layers never start.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Command;

use serde_json::Value;

use super::graph::DagGraph;
use super::model::NodeModel;
use super::piper::ARG_TOKEN;
use crate::error::{PipelimeError, Result};
use crate::schema::SampleSchema;
use crate::underfolder::UnderfolderReader;

/// Flatten one recognized argument into command-line chunks. Lists emit the
/// flag once per element; tuples (nested lists) emit the flag followed by
/// every element; maps emit the flag followed by key/value pairs; other
/// scalars emit `--<name> <value>`.
fn append_argument(chunks: &mut Vec<String>, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Array(tuple) => {
                        chunks.push(format!("--{name}"));
                        for element in tuple {
                            chunks.push(chunk_str(element));
                        }
                    }
                    other => append_argument(chunks, name, other),
                }
            }
        }
        Value::Object(map) => {
            chunks.push(format!("--{name}"));
            for (key, item) in map {
                chunks.push(key.clone());
                chunks.push(chunk_str(item));
            }
        }
        other => {
            chunks.push(format!("--{name}"));
            chunks.push(chunk_str(other));
        }
    }
}

fn chunk_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the full command line of a node: the command tokens, then flags
/// for inputs, outputs and args.
pub fn build_command_chunks(model: &NodeModel) -> Vec<String> {
    let mut chunks: Vec<String> = model
        .command
        .split_whitespace()
        .map(str::to_string)
        .collect();
    for (name, value) in &model.inputs {
        append_argument(&mut chunks, name, value);
    }
    for (name, value) in &model.outputs {
        append_argument(&mut chunks, name, value);
    }
    for (name, value) in &model.args {
        append_argument(&mut chunks, name, value);
    }
    chunks
}

#[derive(Default)]
pub struct NaiveExecutor {
    validated_paths: HashSet<PathBuf>,
}

impl NaiveExecutor {
    pub fn new() -> NaiveExecutor {
        NaiveExecutor::default()
    }

    /// Run the whole DAG under the given execution token.
    pub fn exec(&mut self, graph: &DagGraph, token: &str) -> Result<()> {
        self.validated_paths.clear();
        let stack = graph.build_execution_stack()?;
        for layer in stack {
            for name in layer {
                let model = graph
                    .operation(&name)
                    .ok_or_else(|| PipelimeError::NotFound(format!("operation node '{name}'")))?;
                self.exec_node(&name, model, token)?;
            }
        }
        Ok(())
    }

    fn exec_node(&mut self, name: &str, model: &NodeModel, token: &str) -> Result<()> {
        let mut chunks = build_command_chunks(model);
        chunks.push(ARG_TOKEN.to_string());
        chunks.push(token.to_string());
        tracing::info!("Exec {}", chunks.join(" "));

        self.validate_ports(name, &model.inputs, &model.input_schemas)?;

        let output = Command::new(&chunks[0])
            .args(&chunks[1..])
            .output()
            .map_err(|err| {
                PipelimeError::config(
                    format!("nodes.{name}.command"),
                    format!("cannot spawn '{}': {err}", chunks[0]),
                )
            })?;
        if !output.status.success() {
            return Err(PipelimeError::ChildProcess {
                node: name.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        self.validate_ports(name, &model.outputs, &model.output_schemas)?;
        Ok(())
    }

    /// Validate every port path that names an existing underfolder and has
    /// a declared schema; each path is checked at most once per run.
    fn validate_ports(
        &mut self,
        node: &str,
        ports: &BTreeMap<String, Value>,
        schemas: &BTreeMap<String, PathBuf>,
    ) -> Result<()> {
        for (port, value) in ports {
            let Some(schema_file) = schemas.get(port) else {
                continue;
            };
            for path in port_paths(value) {
                if self.validated_paths.contains(&path) || !path.is_dir() {
                    continue;
                }
                tracing::debug!(
                    "Validating '{}' of node '{node}' against {}",
                    path.display(),
                    schema_file.display()
                );
                let reader = UnderfolderReader::open(&path)?;
                let schema = SampleSchema::load(schema_file)?;
                schema.validate_sequence(reader.sequence()).map_err(|err| {
                    PipelimeError::validation(
                        format!("nodes.{node}.{port}"),
                        err.to_string(),
                    )
                })?;
                self.validated_paths.insert(path);
            }
        }
        Ok(())
    }
}

fn port_paths(value: &Value) -> Vec<PathBuf> {
    match value {
        Value::String(s) => vec![PathBuf::from(s)],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(PathBuf::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// A fresh execution token for one DAG run.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: Value) -> NodeModel {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn chunks_for_scalars_lists_tuples_and_maps() {
        let model = node(json!({
            "command": "pipelime op",
            "inputs": {"src": ["a", "b"]},
            "outputs": {"dst": "out"},
            "args": {
                "pair": [["l", "r"]],
                "opts": {"k": 1},
                "flag": 7
            }
        }));
        let chunks = build_command_chunks(&model);
        assert_eq!(
            chunks,
            vec![
                "pipelime", "op", "--src", "a", "--src", "b", "--dst", "out", "--flag", "7",
                "--opts", "k", "1", "--pair", "l", "r",
            ]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn token_pair_is_appended() {
        let model = node(json!({"command": "proc"}));
        let mut chunks = build_command_chunks(&model);
        chunks.push(ARG_TOKEN.to_string());
        chunks.push("tok".to_string());
        assert_eq!(chunks, vec!["proc", ARG_TOKEN, "tok"]);
    }
}
