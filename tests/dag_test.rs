//! DAG parsing, graph layering and execution integration tests.

mod common;

use pipelime::dag::{
    new_token, parse_dag, DagConfig, DagGraph, NaiveExecutor,
};
use pipelime::PipelimeError;
use tempfile::TempDir;

#[test]
fn foreach_expansion_builds_one_layer_of_three_ops() {
    common::init_logging();
    let config = DagConfig::from_yaml(
        r#"
params:
  inputs: [a, b, c]
nodes:
  proc:
    foreach:
      items: $var(params.inputs)
      do:
        command: proc
        inputs:
          src: $iter(item)
        outputs:
          dst: out_$iter(item)
"#,
    )
    .unwrap();
    let model = parse_dag(&config).unwrap();
    let names: Vec<&String> = model.nodes.keys().collect();
    assert_eq!(names, vec!["proc@0", "proc@1", "proc@2"]);

    let graph = DagGraph::build(&model);
    let stack = graph.build_execution_stack().unwrap();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].len(), 3);

    let leaves = graph.leaf_data_nodes();
    for name in ["out_a", "out_b", "out_c"] {
        assert!(leaves.contains(name), "missing data node {name}");
    }
}

#[test]
fn layered_execution_respects_happens_before() {
    let config = DagConfig::from_yaml(
        r#"
nodes:
  make_a:
    command: "true"
    inputs: {src: raw}
    outputs: {dst: a}
  make_b:
    command: "true"
    inputs: {src: raw}
    outputs: {dst: b}
  join:
    command: "true"
    inputs: {left: a, right: b}
    outputs: {dst: joined}
"#,
    )
    .unwrap();
    let model = parse_dag(&config).unwrap();
    let graph = DagGraph::build(&model);

    let stack = graph.build_execution_stack().unwrap();
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0], vec!["make_a".to_string(), "make_b".to_string()]);
    assert_eq!(stack[1], vec!["join".to_string()]);

    // The whole DAG runs: every command is the no-op `true`.
    NaiveExecutor::new().exec(&graph, &new_token()).unwrap();
}

#[test]
fn failing_child_aborts_the_dag() {
    let config = DagConfig::from_yaml(
        r#"
nodes:
  boom:
    command: "false"
    inputs: {src: raw}
    outputs: {dst: out}
"#,
    )
    .unwrap();
    let graph = DagGraph::build(&parse_dag(&config).unwrap());
    let err = NaiveExecutor::new().exec(&graph, &new_token()).unwrap_err();
    assert!(matches!(err, PipelimeError::ChildProcess { .. }), "{err}");
}

#[test]
fn unknown_command_reports_the_node() {
    let config = DagConfig::from_yaml(
        r#"
nodes:
  ghost:
    command: definitely-not-a-binary-pipelime
    outputs: {dst: out}
"#,
    )
    .unwrap();
    let graph = DagGraph::build(&parse_dag(&config).unwrap());
    let err = NaiveExecutor::new().exec(&graph, &new_token()).unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
}

#[test]
fn input_schema_validation_gates_execution() {
    let dataset = TempDir::new().unwrap();
    common::toy_underfolder(dataset.path(), 3);

    let schema_dir = TempDir::new().unwrap();
    let good_schema = schema_dir.path().join("good.yml");
    std::fs::write(
        &good_schema,
        "items:\n  metadata:\n    kind: metadata\n",
    )
    .unwrap();
    let bad_schema = schema_dir.path().join("bad.yml");
    std::fs::write(
        &bad_schema,
        "items:\n  embeddings:\n    kind: array\n",
    )
    .unwrap();

    let run = |schema: &std::path::Path| {
        let config = DagConfig::from_yaml(&format!(
            r#"
nodes:
  consume:
    command: "true"
    inputs: {{src: {dataset}}}
    input_schemas: {{src: {schema}}}
    outputs: {{dst: out}}
"#,
            dataset = dataset.path().display(),
            schema = schema.display(),
        ))
        .unwrap();
        let graph = DagGraph::build(&parse_dag(&config).unwrap());
        NaiveExecutor::new().exec(&graph, &new_token())
    };

    run(&good_schema).unwrap();
    let err = run(&bad_schema).unwrap_err();
    assert!(matches!(err, PipelimeError::Validation { .. }), "{err}");
}

#[test]
fn unknown_parser_name_is_a_config_error() {
    let config = DagConfig::from_yaml("parser_name: fancy\nnodes: {}\n").unwrap();
    let err = parse_dag(&config).unwrap_err();
    assert!(matches!(err, PipelimeError::Config { .. }), "{err}");
}

#[test]
fn fused_arguments_reach_the_command_line() {
    let config = DagConfig::from_yaml(
        r#"
nodes:
  detector:
    command: detect
    args:
      roi@0: [10, 20]
      roi@1: [30, 40]
    outputs: {dst: out}
"#,
    )
    .unwrap();
    let model = parse_dag(&config).unwrap();
    let chunks = pipelime::dag::build_command_chunks(&model.nodes["detector"]);
    assert_eq!(
        chunks,
        vec!["detect", "--dst", "out", "--roi", "10", "30", "--roi", "20", "40"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
    );
}
