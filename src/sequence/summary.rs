//! Dataset summaries.
//!
//! Inspects the first samples of a sequence and aggregates, per key, the
//! value kinds seen, an array/image shape (dimensions that vary across
//! samples collapse to `-1`), the occurrence count and the file encoding.
//! Useful for quick dataset introspection without reading everything.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::sequence::SampleSequence;
use crate::value::{ItemValue, ValueKind};

/// Aggregated type of one key across the inspected samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub kinds: BTreeSet<ValueKind>,
    /// Shape of array/image values; `-1` marks a dimension that varies.
    pub shape: Option<Vec<i64>>,
}

impl TypeInfo {
    fn of(value: &ItemValue) -> TypeInfo {
        let shape = match value {
            ItemValue::Array(arr) => Some(arr.shape().iter().map(|d| *d as i64).collect()),
            ItemValue::Image(img) => Some(vec![
                img.height() as i64,
                img.width() as i64,
                img.color().channel_count() as i64,
            ]),
            _ => None,
        };
        TypeInfo {
            kinds: BTreeSet::from([value.kind()]),
            shape,
        }
    }

    fn merge(mut self, other: TypeInfo) -> TypeInfo {
        self.kinds.extend(other.kinds);
        self.shape = match (self.shape, other.shape) {
            (Some(a), Some(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(&b)
                    .map(|(x, y)| if x == y { *x } else { -1 })
                    .collect(),
            ),
            _ => None,
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub name: String,
    pub typeinfo: TypeInfo,
    /// How many of the inspected samples carry this key.
    pub count: usize,
    /// Whether every occurrence is backed by one shared file (a root item).
    pub root_item: bool,
    /// File extension backing the item, when file-backed.
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub inspected: usize,
    pub items: Vec<ItemInfo>,
}

impl SequenceSummary {
    pub fn item(&self, name: &str) -> Option<&ItemInfo> {
        self.items.iter().find(|info| info.name == name)
    }
}

struct ItemAccumulator {
    info: ItemInfo,
    source: Option<PathBuf>,
}

/// Summarize the first `max_samples` samples (`0` inspects everything).
pub fn summarize(sequence: &SampleSequence, max_samples: usize) -> Result<SequenceSummary> {
    let limit = if max_samples == 0 {
        sequence.len()
    } else {
        max_samples.min(sequence.len())
    };
    let mut accumulators: Vec<ItemAccumulator> = Vec::new();
    for idx in 0..limit {
        let sample = sequence.get(idx)?;
        for key in sample.keys() {
            let value = sample.get(&key)?;
            let typeinfo = TypeInfo::of(&value);
            let source = sample.metaitem(&key).path().map(|p| p.to_path_buf());
            let encoding = source.as_deref().map(codec::file_extension);
            match accumulators.iter_mut().find(|acc| acc.info.name == key) {
                Some(acc) => {
                    acc.info.typeinfo = acc.info.typeinfo.clone().merge(typeinfo);
                    acc.info.count += 1;
                    // A root item keeps pointing at the same backing file.
                    acc.info.root_item =
                        acc.info.root_item && source.is_some() && acc.source == source;
                }
                None => accumulators.push(ItemAccumulator {
                    info: ItemInfo {
                        name: key,
                        typeinfo,
                        count: 1,
                        root_item: source.is_some(),
                        encoding,
                    },
                    source,
                }),
            }
        }
    }
    Ok(SequenceSummary {
        inspected: limit,
        items: accumulators.into_iter().map(|acc| acc.info).collect(),
    })
}
