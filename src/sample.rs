//! Samples: key-addressed bags of lazily loaded typed items.
//!
//! A sample maps string keys to [`ItemValue`]s and carries an id. Three
//! variants share the capability set (get/set/delete/keys/copy/merge/
//! metaitem): memory samples hold their values directly, filesystem samples
//! decode file-backed items on first access and cache them per key, grouped
//! samples aggregate a group of child samples positionally.
//!
//! Invariants: `metaitem` never performs IO; two `get`s for the same
//! unchanged key return equal values; mutating the cache never touches the
//! underlying files (only a writer does).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{PipelimeError, Result};
use crate::value::ItemValue;

/// Sample identifier: an integer (zero-padded by writers) or an opaque
/// string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SampleId {
    Int(u64),
    Str(String),
}

impl SampleId {
    /// Integer when the whole string is decimal digits, string otherwise.
    pub fn parse(raw: &str) -> SampleId {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            match raw.parse::<u64>() {
                Ok(n) => SampleId::Int(n),
                Err(_) => SampleId::Str(raw.to_string()),
            }
        } else {
            SampleId::Str(raw.to_string())
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            SampleId::Int(n) => Some(*n),
            SampleId::Str(_) => None,
        }
    }

    /// Digits needed to print an integer id; string ids have no zfill.
    pub fn digits(&self) -> usize {
        match self {
            SampleId::Int(n) => n.to_string().len(),
            SampleId::Str(s) => s.len(),
        }
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleId::Int(n) => write!(f, "{n}"),
            SampleId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for SampleId {
    fn from(n: u64) -> SampleId {
        SampleId::Int(n)
    }
}

impl From<&str> for SampleId {
    fn from(s: &str) -> SampleId {
        SampleId::Str(s.to_string())
    }
}

/// Borrowed item descriptor returned by `metaitem`. Building one never
/// triggers IO.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSource {
    /// The value lives only in process memory.
    Memory,
    /// The value is the decoded content of this file.
    File(PathBuf),
    /// The value is an unresolved remote placeholder.
    Remote(Vec<String>),
}

impl ItemSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ItemSource::File(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySample {
    pub id: Option<SampleId>,
    pub data: BTreeMap<String, ItemValue>,
}

#[derive(Debug, Clone)]
pub struct FileSystemSample {
    pub id: Option<SampleId>,
    files: BTreeMap<String, PathBuf>,
    cache: Arc<RwLock<BTreeMap<String, ItemValue>>>,
}

#[derive(Debug, Clone)]
pub struct GroupedSample {
    pub id: Option<SampleId>,
    children: Vec<Sample>,
}

#[derive(Debug, Clone)]
pub enum Sample {
    Memory(MemorySample),
    Filesystem(FileSystemSample),
    Grouped(GroupedSample),
}

impl Sample {
    pub fn from_values(id: impl Into<SampleId>, data: BTreeMap<String, ItemValue>) -> Sample {
        Sample::Memory(MemorySample {
            id: Some(id.into()),
            data,
        })
    }

    pub fn from_files(id: impl Into<SampleId>, files: BTreeMap<String, PathBuf>) -> Sample {
        Sample::Filesystem(FileSystemSample {
            id: Some(id.into()),
            files,
            cache: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    pub fn grouped(id: Option<SampleId>, children: Vec<Sample>) -> Sample {
        Sample::Grouped(GroupedSample { id, children })
    }

    pub fn id(&self) -> Option<&SampleId> {
        match self {
            Sample::Memory(s) => s.id.as_ref(),
            Sample::Filesystem(s) => s.id.as_ref(),
            Sample::Grouped(s) => s.id.as_ref(),
        }
    }

    pub fn set_id(&mut self, id: SampleId) {
        match self {
            Sample::Memory(s) => s.id = Some(id),
            Sample::Filesystem(s) => s.id = Some(id),
            Sample::Grouped(s) => s.id = Some(id),
        }
    }

    /// Load (and cache, for filesystem samples) the value stored under
    /// `key`.
    pub fn get(&self, key: &str) -> Result<ItemValue> {
        match self {
            Sample::Memory(s) => s
                .data
                .get(key)
                .cloned()
                .ok_or_else(|| PipelimeError::NotFound(format!("sample key '{key}'"))),
            Sample::Filesystem(s) => {
                if let Some(value) = s.cache.read().get(key) {
                    return Ok(value.clone());
                }
                let path = s
                    .files
                    .get(key)
                    .ok_or_else(|| PipelimeError::NotFound(format!("sample key '{key}'")))?;
                let value = codec::load_item(path).map_err(|err| match err {
                    PipelimeError::Codec { extension, reason, .. } => PipelimeError::Codec {
                        key: key.to_string(),
                        extension,
                        reason,
                    },
                    other => PipelimeError::codec(
                        key,
                        codec::file_extension(path),
                        other.to_string(),
                    ),
                })?;
                s.cache.write().insert(key.to_string(), value.clone());
                Ok(value)
            }
            Sample::Grouped(s) => {
                let values = s
                    .children
                    .iter()
                    .map(|child| child.get(key))
                    .collect::<Result<Vec<_>>>()?;
                merge_grouped_values(key, values)
            }
        }
    }

    pub fn set(&mut self, key: &str, value: ItemValue) {
        match self {
            Sample::Memory(s) => {
                s.data.insert(key.to_string(), value);
            }
            Sample::Filesystem(s) => {
                s.cache.write().insert(key.to_string(), value);
            }
            Sample::Grouped(s) => {
                for child in &mut s.children {
                    child.set(key, value.clone());
                }
            }
        }
    }

    pub fn delete(&mut self, key: &str) {
        match self {
            Sample::Memory(s) => {
                s.data.remove(key);
            }
            Sample::Filesystem(s) => {
                s.cache.write().remove(key);
                s.files.remove(key);
            }
            Sample::Grouped(s) => {
                for child in &mut s.children {
                    child.delete(key);
                }
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            Sample::Memory(s) => s.data.contains_key(key),
            Sample::Filesystem(s) => {
                s.files.contains_key(key) || s.cache.read().contains_key(key)
            }
            Sample::Grouped(s) => s.children.first().map(|c| c.contains(key)).unwrap_or(false),
        }
    }

    /// All keys, file-backed and cache-only alike, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Sample::Memory(s) => s.data.keys().cloned().collect(),
            Sample::Filesystem(s) => {
                let mut keys: Vec<String> = s.files.keys().cloned().collect();
                for key in s.cache.read().keys() {
                    if !s.files.contains_key(key) {
                        keys.push(key.clone());
                    }
                }
                keys.sort();
                keys
            }
            Sample::Grouped(s) => s.children.first().map(|c| c.keys()).unwrap_or_default(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Whether the value has been materialized since load.
    pub fn is_cached(&self, key: &str) -> bool {
        match self {
            Sample::Memory(s) => s.data.contains_key(key),
            Sample::Filesystem(s) => s.cache.read().contains_key(key),
            Sample::Grouped(s) => s.children.iter().all(|c| c.is_cached(key)),
        }
    }

    /// Discard cached entries without touching the underlying files.
    pub fn flush(&self) {
        match self {
            Sample::Memory(_) => {}
            Sample::Filesystem(s) => s.cache.write().clear(),
            Sample::Grouped(s) => {
                for child in &s.children {
                    child.flush();
                }
            }
        }
    }

    /// Independent copy: the cache is snapshotted, not shared.
    pub fn copy(&self) -> Sample {
        match self {
            Sample::Memory(s) => Sample::Memory(s.clone()),
            Sample::Filesystem(s) => Sample::Filesystem(FileSystemSample {
                id: s.id.clone(),
                files: s.files.clone(),
                cache: Arc::new(RwLock::new(s.cache.read().clone())),
            }),
            Sample::Grouped(s) => Sample::Grouped(GroupedSample {
                id: s.id.clone(),
                children: s.children.iter().map(Sample::copy).collect(),
            }),
        }
    }

    pub fn rename(&mut self, old_key: &str, new_key: &str) {
        match self {
            Sample::Memory(s) => {
                if !s.data.contains_key(new_key) {
                    if let Some(value) = s.data.remove(old_key) {
                        s.data.insert(new_key.to_string(), value);
                    }
                }
            }
            Sample::Filesystem(s) => {
                if !s.files.contains_key(new_key) {
                    if let Some(path) = s.files.remove(old_key) {
                        s.files.insert(new_key.to_string(), path);
                    }
                }
                let mut cache = s.cache.write();
                if !cache.contains_key(new_key) {
                    if let Some(value) = cache.remove(old_key) {
                        cache.insert(new_key.to_string(), value);
                    }
                }
            }
            Sample::Grouped(s) => {
                for child in &mut s.children {
                    child.rename(old_key, new_key);
                }
            }
        }
    }

    /// The descriptor of the value stored under `key`; never performs IO.
    pub fn metaitem(&self, key: &str) -> ItemSource {
        match self {
            Sample::Memory(s) => match s.data.get(key) {
                Some(ItemValue::RemoteList(urls)) => ItemSource::Remote(urls.clone()),
                _ => ItemSource::Memory,
            },
            Sample::Filesystem(s) => match s.files.get(key) {
                Some(path) => ItemSource::File(path.clone()),
                None => match s.cache.read().get(key) {
                    Some(ItemValue::RemoteList(urls)) => ItemSource::Remote(urls.clone()),
                    _ => ItemSource::Memory,
                },
            },
            Sample::Grouped(s) => s
                .children
                .first()
                .map(|c| c.metaitem(key))
                .unwrap_or(ItemSource::Memory),
        }
    }

    /// Right-biased union: keys from `other` win. Cache state is preserved
    /// for keys that already existed. Grouped samples do not merge.
    pub fn merge(&self, other: &Sample) -> Result<Sample> {
        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut cache: BTreeMap<String, ItemValue> = BTreeMap::new();
        let mut saw_files = false;
        for side in [self, other] {
            match side {
                Sample::Memory(s) => {
                    for (k, v) in &s.data {
                        files.remove(k);
                        cache.insert(k.clone(), v.clone());
                    }
                }
                Sample::Filesystem(s) => {
                    saw_files = true;
                    for (k, path) in &s.files {
                        cache.remove(k);
                        files.insert(k.clone(), path.clone());
                    }
                    for (k, v) in s.cache.read().iter() {
                        cache.insert(k.clone(), v.clone());
                    }
                }
                Sample::Grouped(_) => {
                    return Err(PipelimeError::validation(
                        "sample merge",
                        "grouped samples cannot be merged",
                    ))
                }
            }
        }
        let id = other.id().or(self.id()).cloned();
        if saw_files {
            Ok(Sample::Filesystem(FileSystemSample {
                id,
                files,
                cache: Arc::new(RwLock::new(cache)),
            }))
        } else {
            Ok(Sample::Memory(MemorySample { id, data: cache }))
        }
    }

    /// File map of a filesystem sample (used by template introspection).
    pub fn files_map(&self) -> Option<&BTreeMap<String, PathBuf>> {
        match self {
            Sample::Filesystem(s) => Some(&s.files),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&[Sample]> {
        match self {
            Sample::Grouped(s) => Some(&s.children),
            _ => None,
        }
    }
}

/// Positional aggregation for grouped access: metadata objects merge key by
/// key into per-key lists; everything else becomes a plain value list.
/// Children with differing metadata shapes are an error rather than a guess.
fn merge_grouped_values(key: &str, values: Vec<ItemValue>) -> Result<ItemValue> {
    let all_objects = !values.is_empty()
        && values.iter().all(|v| {
            matches!(v, ItemValue::Metadata(serde_json::Value::Object(_)))
        });
    if !all_objects {
        return Ok(ItemValue::List(values));
    }
    let objects: Vec<&serde_json::Map<String, serde_json::Value>> = values
        .iter()
        .map(|v| match v {
            ItemValue::Metadata(serde_json::Value::Object(map)) => map,
            _ => unreachable!(),
        })
        .collect();
    let first_keys: Vec<&String> = objects[0].keys().collect();
    let mut merged = serde_json::Map::new();
    for field in first_keys {
        let mut column = Vec::with_capacity(objects.len());
        for obj in &objects {
            match obj.get(field) {
                Some(value) => column.push(value.clone()),
                None => {
                    return Err(PipelimeError::validation(
                        format!("grouped key '{key}'"),
                        format!("child metadata shapes differ on field '{field}'"),
                    ))
                }
            }
        }
        merged.insert(field.clone(), serde_json::Value::Array(column));
    }
    Ok(ItemValue::Metadata(serde_json::Value::Object(merged)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_sample(id: u64, pairs: &[(&str, i64)]) -> Sample {
        let data = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ItemValue::Metadata(json!(v))))
            .collect();
        Sample::from_values(id, data)
    }

    #[test]
    fn sample_id_parsing() {
        assert_eq!(SampleId::parse("00042"), SampleId::Int(42));
        assert_eq!(SampleId::parse("a3"), SampleId::Str("a3".to_string()));
    }

    #[test]
    fn merge_is_right_biased() {
        let left = memory_sample(0, &[("x", 1), ("a", 10)]);
        let right = memory_sample(0, &[("x", 2), ("b", 20)]);
        let merged = left.merge(&right).unwrap();
        assert_eq!(merged.get("x").unwrap(), ItemValue::Metadata(json!(2)));
        assert_eq!(merged.get("a").unwrap(), ItemValue::Metadata(json!(10)));
        assert_eq!(merged.get("b").unwrap(), ItemValue::Metadata(json!(20)));
    }

    #[test]
    fn grouped_metadata_merges_positionally() {
        let group = Sample::grouped(
            None,
            vec![
                memory_sample(0, &[("meta", 1)]),
                memory_sample(1, &[("meta", 2)]),
            ],
        );
        // Scalar metadata values aggregate as a plain list.
        assert_eq!(
            group.get("meta").unwrap(),
            ItemValue::List(vec![
                ItemValue::Metadata(json!(1)),
                ItemValue::Metadata(json!(2))
            ])
        );

        let objects = Sample::grouped(
            None,
            vec![
                Sample::from_values(0u64, BTreeMap::from([(
                    "meta".to_string(),
                    ItemValue::Metadata(json!({"label": 1})),
                )])),
                Sample::from_values(1u64, BTreeMap::from([(
                    "meta".to_string(),
                    ItemValue::Metadata(json!({"label": 2})),
                )])),
            ],
        );
        assert_eq!(
            objects.get("meta").unwrap(),
            ItemValue::Metadata(json!({"label": [1, 2]}))
        );
    }

    #[test]
    fn grouped_shape_mismatch_is_an_error() {
        let group = Sample::grouped(
            None,
            vec![
                Sample::from_values(0u64, BTreeMap::from([(
                    "meta".to_string(),
                    ItemValue::Metadata(json!({"label": 1})),
                )])),
                Sample::from_values(1u64, BTreeMap::from([(
                    "meta".to_string(),
                    ItemValue::Metadata(json!({"other": 2})),
                )])),
            ],
        );
        assert!(group.get("meta").is_err());
    }
}
