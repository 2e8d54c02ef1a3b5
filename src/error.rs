use std::io;

use regex::Error as RegexError;
use serde_json::Error as JsonError;
use thiserror::Error;
use url::ParseError as UrlParseError;

/// Crate-wide error type.
///
/// Each variant carries the subsystem tag plus the offending key, path or
/// node so the outermost caller can report the failure without re-walking
/// the pipeline. Recoverable decisions (e.g. "remote A failed, try B") stay
/// local and are logged; everything that reaches this type is fatal for the
/// operation that raised it.
#[derive(Debug, Error)]
pub enum PipelimeError {
    /// DAG/stage/operation configuration error: missing key, bad foreach,
    /// unknown placeholder path, unknown type tag.
    #[error("Configuration error at '{path}': {reason}")]
    Config { path: String, reason: String },
    /// No codec is registered for the extension.
    #[error("Unsupported codec extension '{0}'")]
    UnsupportedCodec(String),
    /// A codec failed mid-stream.
    #[error("Codec error for '{key}' ({extension}): {reason}")]
    Codec {
        key: String,
        extension: String,
        reason: String,
    },
    /// Remote backend error (bucket creation, metadata persistence, ...).
    #[error("Remote storage error: {0}")]
    Remote(String),
    /// Every listed URL failed.
    #[error("Remote unreachable, all sources failed: {0}")]
    RemoteUnreachable(String),
    /// Underfolder/graph structural error: missing data folder, link cycle,
    /// sample-count mismatch, cyclic operations-graph.
    #[error("Layout error: {0}")]
    Layout(String),
    #[error("File system error: {0}")]
    Io(String),
    #[error("Item not found: {0}")]
    NotFound(String),
    /// Schema mismatch on a sample or a DAG input/output.
    #[error("Validation failed for '{subject}': {reason}")]
    Validation { subject: String, reason: String },
    /// Non-zero exit from a child command.
    #[error("Child process for node '{node}' failed ({status}): {stderr}")]
    ChildProcess {
        node: String,
        status: i32,
        stderr: String,
    },
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, PipelimeError>;

impl PipelimeError {
    pub fn config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelimeError::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn codec(
        key: impl Into<String>,
        extension: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PipelimeError::Codec {
            key: key.into(),
            extension: extension.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelimeError::Validation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for PipelimeError {
    fn from(src: io::Error) -> Self {
        match src.kind() {
            io::ErrorKind::NotFound => PipelimeError::NotFound(format!("{src}")),
            _ => PipelimeError::Io(format!("{src}")),
        }
    }
}

impl From<JsonError> for PipelimeError {
    fn from(src: JsonError) -> Self {
        PipelimeError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for PipelimeError {
    fn from(src: serde_yaml::Error) -> Self {
        PipelimeError::Serialization(format!("YAML (de)serialization error: {src}"))
    }
}

impl From<toml::de::Error> for PipelimeError {
    fn from(src: toml::de::Error) -> Self {
        PipelimeError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for PipelimeError {
    fn from(src: toml::ser::Error) -> Self {
        PipelimeError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<serde_cbor::Error> for PipelimeError {
    fn from(src: serde_cbor::Error) -> Self {
        PipelimeError::Serialization(format!("CBOR (de)serialization error: {src}"))
    }
}

impl From<image::ImageError> for PipelimeError {
    fn from(src: image::ImageError) -> Self {
        PipelimeError::Serialization(format!("Image transcoding error: {src}"))
    }
}

impl From<zip::result::ZipError> for PipelimeError {
    fn from(src: zip::result::ZipError) -> Self {
        PipelimeError::Serialization(format!("Zip archive error: {src}"))
    }
}

impl From<UrlParseError> for PipelimeError {
    fn from(src: UrlParseError) -> Self {
        PipelimeError::Serialization(format!("Invalid URL: {src}"))
    }
}

impl From<RegexError> for PipelimeError {
    fn from(src: RegexError) -> Self {
        PipelimeError::Serialization(format!("Regex parse failed: {src}"))
    }
}

impl From<ndarray::ShapeError> for PipelimeError {
    fn from(src: ndarray::ShapeError) -> Self {
        PipelimeError::Serialization(format!("Array shape error: {src}"))
    }
}
