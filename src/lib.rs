//! # pipelime
//!
//! A data-processing framework for machine-learning-adjacent datasets. A
//! dataset is a finite ordered sequence of **samples**, each a string-keyed
//! map of typed items (images, arrays, metadata documents, opaque blobs).
//! The crate builds pipelines that read such datasets, transform them and
//! write them back, optionally orchestrated as a DAG of external processes.
//!
//! ## Subsystems
//!
//! - [`sample`] / [`sequence`]: lazy typed items with per-key caching,
//!   ordered collections with on-access stages and reshaping proxies
//!   (filter/sort/slice/concat/cache).
//! - [`codec`]: file-extension driven encode/decode of item payloads, with
//!   image content sniffing for ambiguous files.
//! - [`underfolder`]: the filesystem dataset layout (per-sample files under
//!   `data/`, shared root files, private plugin files for linking and
//!   stages) with a template that lets writers round-trip a reader's
//!   layout.
//! - [`remote`]: content-addressed blob storage over pluggable backends
//!   (local filesystem, S3); uploads are named by content digest, downloads
//!   resume through `.part` files, `.remote` placeholder manifests defer
//!   resolution to read time.
//! - [`sequence::operations`]: whole-sequence transformations (sum, mix,
//!   splits, shuffle, group-by, ...) with declared port arities.
//! - [`dag`]: the configuration DSL (`$var`, `foreach`, argument fusion),
//!   the bipartite operation/data graph, the layered executor driving
//!   child processes, and the progress channel contract.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pipelime::underfolder::{UnderfolderReader, UnderfolderWriter};
//! use pipelime::sequence::operations::{Operation, PipeData};
//!
//! fn main() -> pipelime::Result<()> {
//!     let reader = UnderfolderReader::open("./dataset")?;
//!     let template = reader.reader_template().expect("dataset is not empty");
//!
//!     let shuffled = Operation::Shuffle { seed: 42 }
//!         .apply(PipeData::Single(reader.into_sequence()))?
//!         .into_single()?;
//!
//!     UnderfolderWriter::new("./shuffled", template)?.write(&shuffled)?;
//!     Ok(())
//! }
//! ```
//!
//! Everything that can fail returns [`Result`]; errors carry the subsystem
//! tag plus the offending key, path or node. There is no global runtime:
//! the only process-wide state is the read-mostly remote registry and the
//! optional in-process progress bus.

pub mod codec;
pub mod dag;
pub mod error;
pub mod query;
pub mod remote;
pub mod sample;
pub mod schema;
pub mod sequence;
pub mod underfolder;
pub mod value;

pub use error::{PipelimeError, Result};
pub use sample::{ItemSource, Sample, SampleId};
pub use sequence::{SampleSequence, Stage};
pub use value::{ItemValue, ValueKind};
