//! Whole-sequence transformations.
//!
//! Every [`Operation`] maps [`PipeData`] to [`PipeData`] with a declared
//! input/output port arity, checked at call time. Operations are
//! serde-tagged so pipelines can be described in configuration files;
//! unknown tags are load-time errors.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::stages::Stage;
use super::SampleSequence;
use crate::error::{PipelimeError, Result};
use crate::query::{compare_values, lookup_sample, Expression};
use crate::sample::{Sample, SampleId};
use crate::value::ItemValue;

/// Data flowing between operations: one sequence, an ordered list, or a
/// name-addressed map.
#[derive(Debug, Clone)]
pub enum PipeData {
    Single(SampleSequence),
    List(Vec<SampleSequence>),
    Map(BTreeMap<String, SampleSequence>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Single,
    List,
    Map,
    Any,
}

impl PipeData {
    pub fn kind(&self) -> PortKind {
        match self {
            PipeData::Single(_) => PortKind::Single,
            PipeData::List(_) => PortKind::List,
            PipeData::Map(_) => PortKind::Map,
        }
    }

    pub fn into_single(self) -> Result<SampleSequence> {
        match self {
            PipeData::Single(seq) => Ok(seq),
            other => Err(PipelimeError::validation(
                "operation port",
                format!("expected a single sequence, found {:?}", other.kind()),
            )),
        }
    }

    pub fn into_list(self) -> Result<Vec<SampleSequence>> {
        match self {
            PipeData::List(list) => Ok(list),
            PipeData::Single(seq) => Ok(vec![seq]),
            other => Err(PipelimeError::validation(
                "operation port",
                format!("expected a sequence list, found {:?}", other.kind()),
            )),
        }
    }

    pub fn into_map(self) -> Result<BTreeMap<String, SampleSequence>> {
        match self {
            PipeData::Map(map) => Ok(map),
            other => Err(PipelimeError::validation(
                "operation port",
                format!("expected a sequence map, found {:?}", other.kind()),
            )),
        }
    }
}

/// Integer stride or float ratio of [`Operation::Subsample`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubsampleFactor {
    Stride(u64),
    Ratio(f64),
}

/// Named fraction of [`Operation::Splits`]. Fractions must sum to 1; the
/// last split absorbs the rounding remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub name: String,
    pub fraction: f64,
}

/// Id generator used by [`Operation::ResetIndices`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGenerator {
    #[default]
    Counter,
    Uuid,
}

fn default_true() -> bool {
    true
}

fn default_seed() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Identity,
    /// Concatenate N sequences.
    Sum,
    /// Zip N equal-length sequences with pairwise disjoint key sets.
    Mix,
    Subsample {
        factor: SubsampleFactor,
        #[serde(default)]
        start: usize,
    },
    /// Deterministic when `seed >= 0`, OS-random otherwise.
    Shuffle {
        #[serde(default = "default_seed")]
        seed: i64,
    },
    Splits {
        splits: Vec<SplitSpec>,
    },
    FilterByQuery {
        query: String,
    },
    /// Two sub-sequences: query matches first, the rest second.
    SplitByQuery {
        query: String,
    },
    /// External predicate process: receives the JSON array of per-sample
    /// metadata on stdin, prints a JSON array of booleans on stdout.
    FilterByScript {
        script: PathBuf,
    },
    FilterKeys {
        keys: Vec<String>,
        #[serde(default)]
        negate: bool,
    },
    RemapKeys {
        remap: BTreeMap<String, String>,
        #[serde(default = "default_true")]
        remove_missing: bool,
    },
    /// Lexicographic sort by dotted paths; a `-` prefix sorts descending.
    OrderBy {
        keys: Vec<String>,
    },
    /// Partition into grouped samples by the value at a dotted path.
    GroupBy {
        field: String,
        #[serde(default)]
        ungrouped: bool,
    },
    /// Like group_by, but emits one sub-sequence per distinct value.
    SplitByValue {
        field: String,
    },
    ResetIndices {
        #[serde(default)]
        generator: IdGenerator,
    },
    /// Map-of-sequences to list-of-sequences adapter.
    Dict2List,
}

impl Operation {
    pub fn input_port(&self) -> PortKind {
        match self {
            Operation::Identity => PortKind::Any,
            Operation::Sum | Operation::Mix => PortKind::List,
            Operation::Dict2List => PortKind::Map,
            _ => PortKind::Single,
        }
    }

    pub fn output_port(&self) -> PortKind {
        match self {
            Operation::Identity => PortKind::Any,
            Operation::Splits { .. } => PortKind::Map,
            Operation::SplitByQuery { .. } | Operation::SplitByValue { .. } => PortKind::List,
            Operation::Dict2List => PortKind::List,
            _ => PortKind::Single,
        }
    }

    pub fn apply(&self, input: PipeData) -> Result<PipeData> {
        let expected = self.input_port();
        if expected != PortKind::Any && expected != input.kind() {
            return Err(PipelimeError::validation(
                "operation port",
                format!(
                    "operation expects a {:?} input, found {:?}",
                    expected,
                    input.kind()
                ),
            ));
        }
        match self {
            Operation::Identity => Ok(input),
            Operation::Sum => {
                let mut samples = Vec::new();
                for seq in input.into_list()? {
                    samples.extend(seq.to_samples()?);
                }
                Ok(PipeData::Single(SampleSequence::new(samples)))
            }
            Operation::Mix => mix(input.into_list()?),
            Operation::Subsample { factor, start } => {
                let samples = input.into_single()?.to_samples()?;
                let tail: Vec<Sample> = samples.into_iter().skip(*start).collect();
                let kept: Vec<Sample> = match factor {
                    SubsampleFactor::Stride(k) => {
                        if *k == 0 {
                            return Err(PipelimeError::config(
                                "subsample.factor",
                                "stride cannot be zero",
                            ));
                        }
                        tail.into_iter().step_by(*k as usize).collect()
                    }
                    SubsampleFactor::Ratio(p) => {
                        let size = (tail.len() as f64 * p.clamp(0.0, 1.0)) as usize;
                        tail.into_iter().take(size).collect()
                    }
                };
                Ok(PipeData::Single(SampleSequence::new(kept)))
            }
            Operation::Shuffle { seed } => {
                let mut samples = input.into_single()?.to_samples()?;
                if *seed >= 0 {
                    let mut rng = StdRng::seed_from_u64(*seed as u64);
                    samples.shuffle(&mut rng);
                } else {
                    samples.shuffle(&mut rand::thread_rng());
                }
                Ok(PipeData::Single(SampleSequence::new(samples)))
            }
            Operation::Splits { splits } => {
                let samples = input.into_single()?.to_samples()?;
                split_by_fractions(samples, splits).map(PipeData::Map)
            }
            Operation::FilterByQuery { query } => {
                let expr = Expression::parse(query)?;
                let samples = input
                    .into_single()?
                    .to_samples()?
                    .into_iter()
                    .filter(|s| expr.matches(s))
                    .collect();
                Ok(PipeData::Single(SampleSequence::new(samples)))
            }
            Operation::SplitByQuery { query } => {
                let expr = Expression::parse(query)?;
                let (hits, misses): (Vec<Sample>, Vec<Sample>) = input
                    .into_single()?
                    .to_samples()?
                    .into_iter()
                    .partition(|s| expr.matches(s));
                Ok(PipeData::List(vec![
                    SampleSequence::new(hits),
                    SampleSequence::new(misses),
                ]))
            }
            Operation::FilterByScript { script } => {
                let samples = input.into_single()?.to_samples()?;
                let verdicts = run_filter_script(script, &samples)?;
                let kept = samples
                    .into_iter()
                    .zip(verdicts)
                    .filter_map(|(s, keep)| keep.then_some(s))
                    .collect();
                Ok(PipeData::Single(SampleSequence::new(kept)))
            }
            Operation::FilterKeys { keys, negate } => {
                stage_map(input, Stage::KeyFilter {
                    keys: keys.clone(),
                    negate: *negate,
                })
            }
            Operation::RemapKeys {
                remap,
                remove_missing,
            } => stage_map(input, Stage::KeyRemap {
                remap: remap.clone(),
                remove_missing: *remove_missing,
            }),
            Operation::OrderBy { keys } => {
                let mut samples = input.into_single()?.to_samples()?;
                order_by(&mut samples, keys);
                Ok(PipeData::Single(SampleSequence::new(samples)))
            }
            Operation::GroupBy { field, ungrouped } => {
                let samples = input.into_single()?.to_samples()?;
                let (groups, missing) = group_samples(samples, field);
                let mut out = Vec::new();
                for (value, members) in groups {
                    out.push(make_group(members, value));
                }
                if !missing.is_empty() && *ungrouped {
                    out.push(make_group(missing, serde_json::Value::Null));
                }
                Ok(PipeData::Single(SampleSequence::new(out)))
            }
            Operation::SplitByValue { field } => {
                let samples = input.into_single()?.to_samples()?;
                let (groups, _missing) = group_samples(samples, field);
                Ok(PipeData::List(
                    groups
                        .into_iter()
                        .map(|(_, members)| SampleSequence::new(members))
                        .collect(),
                ))
            }
            Operation::ResetIndices { generator } => {
                let mut samples = input.into_single()?.to_samples()?;
                for (idx, sample) in samples.iter_mut().enumerate() {
                    let id = match generator {
                        IdGenerator::Counter => SampleId::Int(idx as u64),
                        IdGenerator::Uuid => SampleId::Str(uuid::Uuid::new_v4().to_string()),
                    };
                    sample.set_id(id);
                }
                Ok(PipeData::Single(SampleSequence::new(samples)))
            }
            Operation::Dict2List => Ok(PipeData::List(
                input.into_map()?.into_values().collect(),
            )),
        }
    }
}

fn stage_map(input: PipeData, stage: Stage) -> Result<PipeData> {
    let samples = input
        .into_single()?
        .to_samples()?
        .iter()
        .map(|s| stage.apply(s))
        .collect::<Result<Vec<_>>>()?;
    Ok(PipeData::Single(SampleSequence::new(samples)))
}

fn mix(sources: Vec<SampleSequence>) -> Result<PipeData> {
    let Some(first) = sources.first() else {
        return Ok(PipeData::Single(SampleSequence::default()));
    };
    if sources.iter().any(|s| s.len() != first.len()) {
        return Err(PipelimeError::validation(
            "mix",
            "sequences must have equal lengths",
        ));
    }
    let materialized: Vec<Vec<Sample>> = sources
        .iter()
        .map(SampleSequence::to_samples)
        .collect::<Result<Vec<_>>>()?;
    // Key sets must be pairwise disjoint so the merge never hides a value.
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (src_idx, samples) in materialized.iter().enumerate() {
        if let Some(sample) = samples.first() {
            for key in sample.keys() {
                if let Some(other) = seen.insert(key.clone(), src_idx) {
                    return Err(PipelimeError::validation(
                        "mix",
                        format!("key '{key}' appears in sequences {other} and {src_idx}"),
                    ));
                }
            }
        }
    }
    let mut merged = Vec::with_capacity(first.len());
    for idx in 0..first.len() {
        let mut acc = materialized[0][idx].clone();
        for samples in &materialized[1..] {
            acc = acc.merge(&samples[idx])?;
        }
        merged.push(acc);
    }
    Ok(PipeData::Single(SampleSequence::new(merged)))
}

fn split_by_fractions(
    samples: Vec<Sample>,
    splits: &[SplitSpec],
) -> Result<BTreeMap<String, SampleSequence>> {
    let total: f64 = splits.iter().map(|s| s.fraction).sum();
    if splits.is_empty() || (total - 1.0).abs() > 1e-6 {
        return Err(PipelimeError::config(
            "splits",
            format!("split fractions must sum to 1.0, found {total}"),
        ));
    }
    let len = samples.len();
    let mut sizes: Vec<usize> = splits
        .iter()
        .map(|s| (len as f64 * s.fraction) as usize)
        .collect();
    let assigned: usize = sizes.iter().sum();
    // The last split absorbs the rounding remainder.
    *sizes.last_mut().expect("splits is non-empty") += len - assigned;

    let mut out = BTreeMap::new();
    let mut iter = samples.into_iter();
    for (spec, size) in splits.iter().zip(sizes) {
        let chunk: Vec<Sample> = iter.by_ref().take(size).collect();
        out.insert(spec.name.clone(), SampleSequence::new(chunk));
    }
    Ok(out)
}

fn order_by(samples: &mut [Sample], keys: &[String]) {
    samples.sort_by(|a, b| {
        for key in keys {
            let (path, descending) = match key.strip_prefix('-') {
                Some(path) => (path, true),
                None => (key.as_str(), false),
            };
            let left = lookup_sample(a, path).unwrap_or(serde_json::Value::Null);
            let right = lookup_sample(b, path).unwrap_or(serde_json::Value::Null);
            let mut ordering = compare_values(&left, &right);
            if descending {
                ordering = ordering.reverse();
            }
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Partition samples by the value at `field`, keeping first-seen group
/// order. Samples lacking the field land in the second return.
fn group_samples(
    samples: Vec<Sample>,
    field: &str,
) -> (Vec<(serde_json::Value, Vec<Sample>)>, Vec<Sample>) {
    let mut groups: Vec<(serde_json::Value, Vec<Sample>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut missing = Vec::new();
    for sample in samples {
        match lookup_sample(&sample, field) {
            Some(value) => {
                let tag = value.to_string();
                match index.get(&tag) {
                    Some(slot) => groups[*slot].1.push(sample),
                    None => {
                        index.insert(tag, groups.len());
                        groups.push((value, vec![sample]));
                    }
                }
            }
            None => missing.push(sample),
        }
    }
    (groups, missing)
}

fn make_group(members: Vec<Sample>, value: serde_json::Value) -> Sample {
    let mut group = Sample::grouped(None, members);
    group.set("__groupbyvalue__", ItemValue::Metadata(value));
    group
}

fn run_filter_script(script: &PathBuf, samples: &[Sample]) -> Result<Vec<bool>> {
    let mut payload = Vec::with_capacity(samples.len());
    for sample in samples {
        let mut entry = serde_json::Map::new();
        if let Some(id) = sample.id() {
            entry.insert("id".to_string(), serde_json::json!(id.to_string()));
        }
        for key in sample.keys() {
            if let Ok(ItemValue::Metadata(value)) = sample.get(&key) {
                entry.insert(key, value);
            }
        }
        payload.push(serde_json::Value::Object(entry));
    }

    let mut child = Command::new(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            PipelimeError::config(
                format!("filter_by_script.{}", script.display()),
                format!("cannot spawn predicate: {err}"),
            )
        })?;
    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(&serde_json::to_vec(&payload)?)?;
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(PipelimeError::ChildProcess {
            node: script.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    let verdicts: Vec<bool> = serde_json::from_slice(&output.stdout)?;
    if verdicts.len() != samples.len() {
        return Err(PipelimeError::validation(
            "filter_by_script",
            format!(
                "predicate returned {} verdicts for {} samples",
                verdicts.len(),
                samples.len()
            ),
        ));
    }
    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sequence(n: u64) -> SampleSequence {
        SampleSequence::new(
            (0..n)
                .map(|i| {
                    Sample::from_values(
                        i,
                        BTreeMap::from([(
                            "metadata".to_string(),
                            ItemValue::Metadata(json!({"num": i, "parity": i % 2})),
                        )]),
                    )
                })
                .collect(),
        )
    }

    fn nums(seq: &SampleSequence) -> Vec<u64> {
        seq.raw()
            .iter()
            .map(|s| {
                lookup_sample(s, "metadata.num")
                    .and_then(|v| v.as_u64())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn sum_concatenates() {
        let out = Operation::Sum
            .apply(PipeData::List(vec![sequence(3), sequence(2)]))
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(nums(&out), vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn mix_merges_disjoint_keys() {
        let left = SampleSequence::new(vec![Sample::from_values(
            0u64,
            BTreeMap::from([("a".to_string(), ItemValue::Metadata(json!(1)))]),
        )]);
        let right = SampleSequence::new(vec![Sample::from_values(
            0u64,
            BTreeMap::from([("b".to_string(), ItemValue::Metadata(json!(2)))]),
        )]);
        let out = Operation::Mix
            .apply(PipeData::List(vec![left.clone(), right]))
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(out.raw()[0].keys(), vec!["a".to_string(), "b".to_string()]);

        let overlapping = Operation::Mix.apply(PipeData::List(vec![left.clone(), left]));
        assert!(overlapping.is_err());
    }

    #[test]
    fn subsample_stride_and_ratio() {
        let stride = Operation::Subsample {
            factor: SubsampleFactor::Stride(2),
            start: 0,
        }
        .apply(PipeData::Single(sequence(6)))
        .unwrap()
        .into_single()
        .unwrap();
        assert_eq!(nums(&stride), vec![0, 2, 4]);

        let ratio = Operation::Subsample {
            factor: SubsampleFactor::Ratio(0.5),
            start: 0,
        }
        .apply(PipeData::Single(sequence(6)))
        .unwrap()
        .into_single()
        .unwrap();
        assert_eq!(nums(&ratio), vec![0, 1, 2]);
    }

    #[test]
    fn shuffle_is_deterministic_with_seed() {
        let a = Operation::Shuffle { seed: 42 }
            .apply(PipeData::Single(sequence(16)))
            .unwrap()
            .into_single()
            .unwrap();
        let b = Operation::Shuffle { seed: 42 }
            .apply(PipeData::Single(sequence(16)))
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(nums(&a), nums(&b));
        assert_ne!(nums(&a), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn splits_partition_everything() {
        let out = Operation::Splits {
            splits: vec![
                SplitSpec {
                    name: "train".to_string(),
                    fraction: 0.8,
                },
                SplitSpec {
                    name: "val".to_string(),
                    fraction: 0.2,
                },
            ],
        }
        .apply(PipeData::Single(sequence(10)))
        .unwrap()
        .into_map()
        .unwrap();
        assert_eq!(out["train"].len(), 8);
        assert_eq!(out["val"].len(), 2);

        // Remainder is absorbed by the last split.
        let out = Operation::Splits {
            splits: vec![
                SplitSpec {
                    name: "a".to_string(),
                    fraction: 0.5,
                },
                SplitSpec {
                    name: "b".to_string(),
                    fraction: 0.5,
                },
            ],
        }
        .apply(PipeData::Single(sequence(7)))
        .unwrap()
        .into_map()
        .unwrap();
        assert_eq!(out["a"].len() + out["b"].len(), 7);
        assert_eq!(out["b"].len(), 4);
    }

    #[test]
    fn filter_and_split_by_query() {
        let filtered = Operation::FilterByQuery {
            query: "`metadata.parity` == 0".to_string(),
        }
        .apply(PipeData::Single(sequence(6)))
        .unwrap()
        .into_single()
        .unwrap();
        assert_eq!(nums(&filtered), vec![0, 2, 4]);

        let split = Operation::SplitByQuery {
            query: "`metadata.parity` == 0".to_string(),
        }
        .apply(PipeData::Single(sequence(6)))
        .unwrap()
        .into_list()
        .unwrap();
        assert_eq!(nums(&split[0]), vec![0, 2, 4]);
        assert_eq!(nums(&split[1]), vec![1, 3, 5]);
    }

    #[test]
    fn order_by_descending() {
        let out = Operation::OrderBy {
            keys: vec!["-metadata.num".to_string()],
        }
        .apply(PipeData::Single(sequence(4)))
        .unwrap()
        .into_single()
        .unwrap();
        assert_eq!(nums(&out), vec![3, 2, 1, 0]);
    }

    #[test]
    fn group_by_collects_matching_samples() {
        let out = Operation::GroupBy {
            field: "metadata.parity".to_string(),
            ungrouped: false,
        }
        .apply(PipeData::Single(sequence(6)))
        .unwrap()
        .into_single()
        .unwrap();
        assert_eq!(out.len(), 2);
        let first = &out.raw()[0];
        assert_eq!(first.children().unwrap().len(), 3);
    }

    #[test]
    fn reset_indices_renumbers() {
        let shuffled = Operation::Shuffle { seed: 7 }
            .apply(PipeData::Single(sequence(5)))
            .unwrap();
        let out = Operation::ResetIndices {
            generator: IdGenerator::Counter,
        }
        .apply(shuffled)
        .unwrap()
        .into_single()
        .unwrap();
        let ids: Vec<u64> = out
            .raw()
            .iter()
            .map(|s| s.id().unwrap().as_int().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn port_mismatch_is_rejected() {
        let err = Operation::Sum.apply(PipeData::Map(BTreeMap::new()));
        assert!(err.is_err());
    }

    #[test]
    fn operations_roundtrip_through_yaml() {
        let op = Operation::Subsample {
            factor: SubsampleFactor::Ratio(0.25),
            start: 1,
        };
        let text = serde_yaml::to_string(&op).unwrap();
        let back: Operation = serde_yaml::from_str(&text).unwrap();
        assert!(matches!(
            back,
            Operation::Subsample {
                factor: SubsampleFactor::Ratio(_),
                start: 1
            }
        ));
    }
}
