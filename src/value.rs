//! Decoded item payloads.
//!
//! Every item of a [`Sample`](crate::sample::Sample) decodes to an
//! [`ItemValue`]: images, numeric arrays, structured metadata, raw bytes,
//! remote URL lists, or (for grouped samples) lists of child values.
//! [`ValueKind`] is the shape-only mirror used by schema validation.

use std::fmt;

use image::DynamicImage;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{PipelimeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    /// Decoded raster image.
    Image(DynamicImage),
    /// n-D numeric array (numpy-native and numpy-text codecs).
    Array(ArrayD<f64>),
    /// Nested mapping/sequence (json/yaml/toml codecs).
    Metadata(serde_json::Value),
    /// Raw byte string (`bin` codec).
    Bytes(Vec<u8>),
    /// Unresolved remote placeholder: one URL per source, in priority order.
    RemoteList(Vec<String>),
    /// Positional aggregation produced by grouped samples.
    List(Vec<ItemValue>),
}

/// Shape-only category of an [`ItemValue`], used by sample schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Image,
    Array,
    Metadata,
    Bytes,
    Remote,
    List,
    /// Matches every kind.
    Any,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Image => "image",
            ValueKind::Array => "array",
            ValueKind::Metadata => "metadata",
            ValueKind::Bytes => "bytes",
            ValueKind::Remote => "remote",
            ValueKind::List => "list",
            ValueKind::Any => "any",
        };
        f.write_str(name)
    }
}

impl ItemValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ItemValue::Image(_) => ValueKind::Image,
            ItemValue::Array(_) => ValueKind::Array,
            ItemValue::Metadata(_) => ValueKind::Metadata,
            ItemValue::Bytes(_) => ValueKind::Bytes,
            ItemValue::RemoteList(_) => ValueKind::Remote,
            ItemValue::List(_) => ValueKind::List,
        }
    }

    pub fn as_metadata(&self) -> Option<&serde_json::Value> {
        match self {
            ItemValue::Metadata(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayD<f64>> {
        match self {
            ItemValue::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&DynamicImage> {
        match self {
            ItemValue::Image(v) => Some(v),
            _ => None,
        }
    }
}

/// Wire representation for values that must survive opaque binary storage
/// (the pickle-category codec and the persistent sample cache). Images ride
/// as losslessly encoded PNG bytes, arrays as shape + row-major data.
#[derive(Serialize, Deserialize)]
enum WireValue {
    Image(Vec<u8>),
    Array { shape: Vec<usize>, data: Vec<f64> },
    Metadata(serde_json::Value),
    Bytes(Vec<u8>),
    RemoteList(Vec<String>),
    List(Vec<WireValue>),
}

impl WireValue {
    fn from_value(value: &ItemValue) -> Result<WireValue> {
        Ok(match value {
            ItemValue::Image(img) => {
                let mut buf = std::io::Cursor::new(Vec::new());
                img.write_to(&mut buf, image::ImageFormat::Png)?;
                WireValue::Image(buf.into_inner())
            }
            ItemValue::Array(arr) => WireValue::Array {
                shape: arr.shape().to_vec(),
                data: arr.iter().copied().collect(),
            },
            ItemValue::Metadata(v) => WireValue::Metadata(v.clone()),
            ItemValue::Bytes(b) => WireValue::Bytes(b.clone()),
            ItemValue::RemoteList(urls) => WireValue::RemoteList(urls.clone()),
            ItemValue::List(items) => WireValue::List(
                items
                    .iter()
                    .map(WireValue::from_value)
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    fn into_value(self) -> Result<ItemValue> {
        Ok(match self {
            WireValue::Image(bytes) => {
                ItemValue::Image(image::load_from_memory_with_format(
                    &bytes,
                    image::ImageFormat::Png,
                )?)
            }
            WireValue::Array { shape, data } => {
                ItemValue::Array(ArrayD::from_shape_vec(shape, data)?)
            }
            WireValue::Metadata(v) => ItemValue::Metadata(v),
            WireValue::Bytes(b) => ItemValue::Bytes(b),
            WireValue::RemoteList(urls) => ItemValue::RemoteList(urls),
            WireValue::List(items) => ItemValue::List(
                items
                    .into_iter()
                    .map(WireValue::into_value)
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

impl ItemValue {
    /// Serialize to the opaque binary form used by the pickle-category codec
    /// and the persistent sequence cache.
    pub fn to_opaque_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(&WireValue::from_value(self)?)?)
    }

    pub fn from_opaque_bytes(bytes: &[u8]) -> Result<ItemValue> {
        let wire: WireValue = serde_cbor::from_slice(bytes)?;
        wire.into_value()
    }

    /// Resolve a dotted path *inside* a metadata value (`num`, `tags.0`,
    /// `info.size.width`). Returns `None` when any segment is missing.
    pub fn lookup(&self, dotted: &str) -> Option<&serde_json::Value> {
        let meta = self.as_metadata()?;
        lookup_value(meta, dotted)
    }
}

/// Dotted-path lookup over a JSON value. Sequence segments accept decimal
/// indices.
pub fn lookup_value<'a>(root: &'a serde_json::Value, dotted: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    if dotted.is_empty() {
        return Some(current);
    }
    for segment in dotted.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Best-effort conversion used by the writer when encoding metadata into
/// toml (toml has no null).
pub fn json_to_toml(value: &serde_json::Value) -> Result<toml::Value> {
    Ok(match value {
        serde_json::Value::Null => {
            return Err(PipelimeError::Serialization(
                "toml cannot represent null values".to_string(),
            ))
        }
        serde_json::Value::Bool(b) => toml::Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                toml::Value::Integer(i)
            } else {
                toml::Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => toml::Value::String(s.clone()),
        serde_json::Value::Array(items) => toml::Value::Array(
            items.iter().map(json_to_toml).collect::<Result<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut table = toml::map::Map::new();
            for (k, v) in map {
                table.insert(k.clone(), json_to_toml(v)?);
            }
            toml::Value::Table(table)
        }
    })
}

pub fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}
