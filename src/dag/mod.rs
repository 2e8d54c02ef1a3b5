//! DAG configuration, graph and execution.
//!
//! A DAG run goes through four pieces: [`parser`] expands the configuration
//! DSL (`$var`, `foreach`, argument fusion) into the typed [`model`];
//! [`graph`] builds the bipartite operation/data graph and the layered
//! execution stack; [`executor`] drives one child process per operation
//! node under a shared execution token; [`progress`] carries the optional
//! event channel children report on, and [`piper`] is the child-side
//! contract.

pub mod executor;
pub mod graph;
pub mod model;
pub mod parser;
pub mod piper;
pub mod progress;

pub use executor::{build_command_chunks, new_token, NaiveExecutor};
pub use graph::{DagGraph, GraphNode};
pub use model::{DagModel, NodeModel};
pub use parser::{parse_dag, DagConfig, SimpleParser};
pub use piper::{PiperContext, PiperInfo};
pub use progress::{
    channel_for_token, FilesystemChannel, MemoryBus, NullSink, ProgressEvent, ProgressSink,
};
