//! Ordered sample collections.
//!
//! A [`SampleSequence`] owns its samples plus an optional [`Stage`] applied
//! at read time. Reshaping views (filter/sort/slice/concat/cache) live in
//! [`proxies`]; whole-sequence transformations in [`operations`].

use std::sync::Arc;

use crate::error::{PipelimeError, Result};
use crate::sample::{Sample, SampleId};

pub mod operations;
pub mod proxies;
pub mod stages;
pub mod summary;

pub use stages::Stage;

#[derive(Debug, Clone, Default)]
pub struct SampleSequence {
    samples: Vec<Sample>,
    stage: Option<Arc<Stage>>,
}

impl SampleSequence {
    pub fn new(samples: Vec<Sample>) -> SampleSequence {
        SampleSequence {
            samples,
            stage: None,
        }
    }

    pub fn with_stage(samples: Vec<Sample>, stage: Option<Arc<Stage>>) -> SampleSequence {
        SampleSequence { samples, stage }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The sample at `idx` with the sequence stage applied.
    pub fn get(&self, idx: usize) -> Result<Sample> {
        let sample = self
            .samples
            .get(idx)
            .ok_or_else(|| PipelimeError::NotFound(format!("sample index {idx}")))?;
        match &self.stage {
            Some(stage) => stage.apply(sample),
            None => Ok(sample.clone()),
        }
    }

    /// Raw samples, stage not applied.
    pub fn raw(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_raw(self) -> Vec<Sample> {
        self.samples
    }

    pub fn stage(&self) -> Option<&Arc<Stage>> {
        self.stage.as_ref()
    }

    pub fn set_stage(&mut self, stage: Option<Arc<Stage>>) {
        self.stage = stage;
    }

    /// Append `stage` after the current one.
    pub fn push_stage(&mut self, stage: Stage) {
        self.stage = Stage::compose_opt(self.stage.take(), Some(Arc::new(stage)));
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Result<Sample>> + '_ {
        (0..self.len()).map(move |idx| self.get(idx))
    }

    /// Materialize every sample with the stage applied.
    pub fn to_samples(&self) -> Result<Vec<Sample>> {
        self.iter().collect()
    }

    /// Minimum width needed to format the integer sample ids as fixed-width
    /// strings.
    pub fn best_zfill(&self) -> usize {
        let from_ids = self
            .samples
            .iter()
            .filter_map(|s| s.id().and_then(SampleId::as_int))
            .map(|id| id.to_string().len())
            .max();
        let from_len = match self.len() {
            0 => 1,
            n => (n - 1).max(1).to_string().len(),
        };
        from_ids.unwrap_or(from_len).max(1)
    }
}

impl From<Vec<Sample>> for SampleSequence {
    fn from(samples: Vec<Sample>) -> SampleSequence {
        SampleSequence::new(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ItemValue;
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

    #[test]
    fn best_zfill_follows_the_largest_id() {
        assert_eq!(sequence(5).best_zfill(), 1);
        assert_eq!(sequence(32).best_zfill(), 2);
        assert_eq!(sequence(150).best_zfill(), 3);
    }

    #[test]
    fn stage_is_applied_at_read() {
        let mut seq = sequence(3);
        seq.push_stage(Stage::KeyFilter {
            keys: vec!["meta".to_string()],
            negate: true,
        });
        assert!(seq.get(0).unwrap().is_empty());
        // Raw access bypasses the stage.
        assert!(!seq.raw()[0].is_empty());
    }
}
