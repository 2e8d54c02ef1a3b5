//! Sequence views: filter, sort, slice, concat and cache.
//!
//! Filter/sort/slice precompute their surviving sample list at construction
//! (the source stage is preserved and still applied at read). Concat keeps
//! its sources and applies each source's own stage before the outer one.
//! The cached view interposes a cache policy between the caller and an
//! expensive source.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{SampleSequence, Stage};
use crate::error::{PipelimeError, Result};
use crate::sample::{ItemSource, Sample, SampleId};
use crate::value::ItemValue;

/// Filtered view: keeps the source samples for which `filter_fn` holds.
pub fn filtered<F>(source: &SampleSequence, filter_fn: F) -> SampleSequence
where
    F: Fn(&Sample) -> bool,
{
    let samples = source
        .raw()
        .iter()
        .filter(|s| filter_fn(s))
        .cloned()
        .collect();
    SampleSequence::with_stage(samples, source.stage().cloned())
}

/// Sorted view: stable sort of the source samples by `key_fn`.
pub fn sorted_by<K, F>(source: &SampleSequence, key_fn: F) -> SampleSequence
where
    K: Ord,
    F: Fn(&Sample) -> K,
{
    let mut samples: Vec<Sample> = source.raw().to_vec();
    samples.sort_by_key(|s| key_fn(s));
    SampleSequence::with_stage(samples, source.stage().cloned())
}

/// The index walk of a Python slice `[start:stop:step]` over `len`
/// elements, including negative bounds and negative step.
pub fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(PipelimeError::config("slice.step", "step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);
    let resolve = |v: i64| if v < 0 { v + len } else { v };

    let (start, stop) = if step > 0 {
        (
            clamp(start.map(resolve).unwrap_or(0), 0, len),
            clamp(stop.map(resolve).unwrap_or(len), 0, len),
        )
    } else {
        (
            clamp(start.map(resolve).unwrap_or(len - 1), -1, len - 1),
            clamp(stop.map(resolve).unwrap_or(-1), -1, len - 1),
        )
    };

    let mut indices = Vec::new();
    let mut idx = start;
    while (step > 0 && idx < stop) || (step < 0 && idx > stop) {
        indices.push(idx as usize);
        idx += step;
    }
    Ok(indices)
}

/// Sliced view with Python slice semantics.
pub fn sliced(
    source: &SampleSequence,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<SampleSequence> {
    let samples = slice_indices(source.len(), start, stop, step)?
        .into_iter()
        .map(|idx| source.raw()[idx].clone())
        .collect();
    Ok(SampleSequence::with_stage(samples, source.stage().cloned()))
}

/// Ordered concatenation of several sequences. Each source's own stage is
/// applied before the outer stage.
#[derive(Debug, Clone, Default)]
pub struct ConcatSequence {
    sources: Vec<SampleSequence>,
    bounds: Vec<usize>,
    stage: Option<Arc<Stage>>,
}

impl ConcatSequence {
    pub fn new(sources: Vec<SampleSequence>, stage: Option<Arc<Stage>>) -> ConcatSequence {
        let mut bounds = vec![0];
        for source in &sources {
            bounds.push(bounds.last().unwrap() + source.len());
        }
        ConcatSequence {
            sources,
            bounds,
            stage,
        }
    }

    pub fn len(&self) -> usize {
        *self.bounds.last().unwrap_or(&0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Result<Sample> {
        if idx >= self.len() {
            return Err(PipelimeError::NotFound(format!("sample index {idx}")));
        }
        let segment = self.bounds.partition_point(|b| *b <= idx) - 1;
        let sample = self.sources[segment].get(idx - self.bounds[segment])?;
        match &self.stage {
            Some(stage) => stage.apply(&sample),
            None => Ok(sample),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Sample>> + '_ {
        (0..self.len()).map(move |idx| self.get(idx))
    }
}

/// Cache discipline of a [`CachedSequence`].
#[derive(Debug, Clone)]
pub enum CachePolicy {
    /// Unbounded in-memory map.
    Endless,
    /// Keep only the last `n` materialized samples; eviction is FIFO by
    /// insertion order, not LRU.
    BoundedFifo(usize),
    /// Serialize samples under `dir`, keyed by (index, source signature),
    /// with an optional in-memory FIFO of `buffer` entries in front.
    Persistent { dir: PathBuf, buffer: usize },
}

#[derive(Default)]
struct CacheState {
    map: HashMap<usize, Sample>,
    order: VecDeque<usize>,
}

/// Caching view over a source sequence.
///
/// `cached.get(i)` equals what `source.get(i)` returned when the entry was
/// created. On a miss the sample is copied, its `forced_keys` (or all keys)
/// are loaded, and the copy is stored. Not meant for cross-thread sharing:
/// callers serialize access per cache.
pub struct CachedSequence {
    source: SampleSequence,
    policy: CachePolicy,
    forced_keys: Option<Vec<String>>,
    signature: String,
    state: Mutex<CacheState>,
}

#[derive(Serialize, Deserialize)]
struct StoredSample {
    id: Option<SampleId>,
    entries: Vec<(String, Vec<u8>)>,
}

impl CachedSequence {
    pub fn new(
        source: SampleSequence,
        policy: CachePolicy,
        forced_keys: Option<Vec<String>>,
    ) -> CachedSequence {
        let signature = source_signature(&source);
        CachedSequence {
            source,
            policy,
            forced_keys,
            signature,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<Sample> {
        if let Some(sample) = self.state.lock().map.get(&idx) {
            return Ok(sample.clone());
        }
        if let CachePolicy::Persistent { dir, .. } = &self.policy {
            if let Some(sample) = self.load_persistent(dir, idx)? {
                self.buffer_in_memory(idx, &sample);
                return Ok(sample);
            }
        }

        let sample = self.materialize(idx)?;
        match &self.policy {
            CachePolicy::Endless => {
                let mut state = self.state.lock();
                state.map.insert(idx, sample.clone());
                state.order.push_back(idx);
            }
            CachePolicy::BoundedFifo(max) => self.push_fifo(idx, &sample, *max),
            CachePolicy::Persistent { dir, .. } => {
                self.store_persistent(dir, idx, &sample)?;
                self.buffer_in_memory(idx, &sample);
            }
        }
        Ok(sample)
    }

    /// Evaluate the source sample with its lazy keys loaded, so the cache
    /// entry is self-contained.
    fn materialize(&self, idx: usize) -> Result<Sample> {
        let sample = self.source.get(idx)?.copy();
        let keys = match &self.forced_keys {
            Some(keys) => keys.clone(),
            None => sample.keys(),
        };
        for key in keys {
            if sample.contains(&key) {
                let _ = sample.get(&key)?;
            }
        }
        Ok(sample)
    }

    fn push_fifo(&self, idx: usize, sample: &Sample, max: usize) {
        if max == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.map.insert(idx, sample.clone());
        state.order.push_back(idx);
        while state.map.len() > max {
            if let Some(evicted) = state.order.pop_front() {
                state.map.remove(&evicted);
            }
        }
    }

    fn buffer_in_memory(&self, idx: usize, sample: &Sample) {
        if let CachePolicy::Persistent { buffer, .. } = &self.policy {
            self.push_fifo(idx, sample, *buffer);
        }
    }

    fn entry_path(&self, dir: &PathBuf, idx: usize) -> PathBuf {
        dir.join(&self.signature).join(format!("{idx}.cbor"))
    }

    fn load_persistent(&self, dir: &PathBuf, idx: usize) -> Result<Option<Sample>> {
        let path = self.entry_path(dir, idx);
        if !path.exists() {
            return Ok(None);
        }
        let stored: StoredSample = serde_cbor::from_slice(&fs::read(&path)?)?;
        let mut data = std::collections::BTreeMap::new();
        for (key, bytes) in stored.entries {
            data.insert(key, ItemValue::from_opaque_bytes(&bytes)?);
        }
        let mut sample = Sample::from_values(0u64, data);
        match stored.id {
            Some(id) => sample.set_id(id),
            None => {}
        }
        Ok(Some(sample))
    }

    fn store_persistent(&self, dir: &PathBuf, idx: usize, sample: &Sample) -> Result<()> {
        let mut entries = Vec::new();
        for key in sample.keys() {
            entries.push((key.clone(), sample.get(&key)?.to_opaque_bytes()?));
        }
        let stored = StoredSample {
            id: sample.id().cloned(),
            entries,
        };
        let path = self.entry_path(dir, idx);
        fs::create_dir_all(path.parent().expect("entry path has a parent"))?;
        fs::write(&path, serde_cbor::to_vec(&stored)?)?;
        Ok(())
    }

    pub fn clear_cache(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.map.clear();
        state.order.clear();
        if let CachePolicy::Persistent { dir, .. } = &self.policy {
            let entry_dir = dir.join(&self.signature);
            if entry_dir.exists() {
                fs::remove_dir_all(&entry_dir)?;
            }
        }
        Ok(())
    }

    /// Concatenate with another sequence; the cache is invalidated.
    pub fn merge(&self, other: &SampleSequence) -> Result<SampleSequence> {
        self.clear_cache()?;
        let mut samples: Vec<Sample> = self.source.raw().to_vec();
        samples.extend_from_slice(other.raw());
        Ok(SampleSequence::new(samples))
    }
}

/// Stable fingerprint of a source sequence: ids plus item sources. Used to
/// key persistent cache entries so a different dataset never aliases them.
fn source_signature(source: &SampleSequence) -> String {
    let mut hasher = Sha256::new();
    for sample in source.raw() {
        if let Some(id) = sample.id() {
            hasher.update(id.to_string().as_bytes());
        }
        for key in sample.keys() {
            hasher.update(key.as_bytes());
            if let ItemSource::File(path) = sample.metaitem(&key) {
                hasher.update(path.to_string_lossy().as_bytes());
            }
        }
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sequence(n: u64) -> SampleSequence {
        SampleSequence::new(
            (0..n)
                .map(|i| {
                    Sample::from_values(
                        i,
                        BTreeMap::from([(
                            "meta".to_string(),
                            ItemValue::Metadata(json!({ "num": i })),
                        )]),
                    )
                })
                .collect(),
        )
    }

    fn ids(seq: &SampleSequence) -> Vec<u64> {
        seq.raw()
            .iter()
            .map(|s| s.id().unwrap().as_int().unwrap())
            .collect()
    }

    #[test]
    fn slice_matches_python_semantics() {
        // Checked against list(range(10))[start:stop:step].
        assert_eq!(slice_indices(10, None, None, None).unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(slice_indices(10, Some(2), Some(7), Some(2)).unwrap(), vec![2, 4, 6]);
        assert_eq!(slice_indices(10, Some(-3), None, None).unwrap(), vec![7, 8, 9]);
        assert_eq!(slice_indices(10, None, Some(-8), None).unwrap(), vec![0, 1]);
        assert_eq!(
            slice_indices(10, None, None, Some(-1)).unwrap(),
            (0..10).rev().collect::<Vec<_>>()
        );
        assert_eq!(slice_indices(10, Some(-2), Some(2), Some(-2)).unwrap(), vec![8, 6, 4]);
        assert_eq!(slice_indices(10, Some(20), None, None).unwrap(), Vec::<usize>::new());
        assert!(slice_indices(10, None, None, Some(0)).is_err());
    }

    #[test]
    fn filtered_and_sorted_views() {
        let seq = sequence(6);
        let even = filtered(&seq, |s| {
            s.id().and_then(SampleId::as_int).unwrap() % 2 == 0
        });
        assert_eq!(ids(&even), vec![0, 2, 4]);

        let descending = sorted_by(&seq, |s| {
            std::cmp::Reverse(s.id().and_then(SampleId::as_int).unwrap())
        });
        assert_eq!(ids(&descending), vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn concat_preserves_lengths_and_order() {
        let concat = ConcatSequence::new(vec![sequence(3), sequence(2)], None);
        assert_eq!(concat.len(), 5);
        let collected: Vec<u64> = concat
            .iter()
            .map(|s| s.unwrap().id().unwrap().as_int().unwrap())
            .collect();
        assert_eq!(collected, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn bounded_cache_evicts_fifo() {
        let cached = CachedSequence::new(sequence(5), CachePolicy::BoundedFifo(2), None);
        cached.get(0).unwrap();
        cached.get(1).unwrap();
        cached.get(2).unwrap();
        let state = cached.state.lock();
        // 0 was inserted first, so 0 is the one evicted.
        assert!(!state.map.contains_key(&0));
        assert!(state.map.contains_key(&1));
        assert!(state.map.contains_key(&2));
    }

    #[test]
    fn persistent_cache_roundtrips_samples() {
        let tmp = tempfile::tempdir().unwrap();
        let seq = sequence(3);
        let cached = CachedSequence::new(
            seq.clone(),
            CachePolicy::Persistent {
                dir: tmp.path().to_path_buf(),
                buffer: 0,
            },
            None,
        );
        let first = cached.get(1).unwrap();
        // A second view over the same source hits the on-disk entry.
        let rebuilt = CachedSequence::new(
            seq,
            CachePolicy::Persistent {
                dir: tmp.path().to_path_buf(),
                buffer: 0,
            },
            None,
        );
        let second = rebuilt.get(1).unwrap();
        assert_eq!(first.get("meta").unwrap(), second.get("meta").unwrap());
        rebuilt.clear_cache().unwrap();
        assert!(!tmp.path().join(&rebuilt.signature).exists());
    }
}
