//! Sample schema validation.
//!
//! A [`SampleSchema`] declares, per key, the expected value kind and whether
//! the key is required. The DAG executor validates declared inputs/outputs
//! against these schemas before and after running a node; the same check is
//! available programmatically for any sequence.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelimeError, Result};
use crate::sample::Sample;
use crate::sequence::SampleSequence;
use crate::value::ValueKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSchema {
    #[serde(default = "default_kind")]
    pub kind: ValueKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_kind() -> ValueKind {
    ValueKind::Any
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSchema {
    pub items: BTreeMap<String, ItemSchema>,
    /// Whether keys not listed in `items` are tolerated.
    #[serde(default = "default_allow_extra")]
    pub allow_extra: bool,
}

fn default_allow_extra() -> bool {
    true
}

impl SampleSchema {
    /// Load a schema file (yaml or json, by extension).
    pub fn load(path: &Path) -> Result<SampleSchema> {
        let bytes = std::fs::read(path)?;
        let schema = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_slice(&bytes)?,
            _ => serde_yaml::from_slice(&bytes)?,
        };
        Ok(schema)
    }

    pub fn validate_sample(&self, sample: &Sample) -> Result<()> {
        let subject = sample
            .id()
            .map(|id| format!("sample {id}"))
            .unwrap_or_else(|| "sample".to_string());
        for (key, item) in &self.items {
            if !sample.contains(key) {
                if item.required {
                    return Err(PipelimeError::validation(
                        subject,
                        format!("missing required key '{key}'"),
                    ));
                }
                continue;
            }
            if item.kind == ValueKind::Any {
                continue;
            }
            let value = sample.get(key)?;
            // An unresolved remote placeholder satisfies any kind: it only
            // materializes to its real kind on read-through.
            let kind = value.kind();
            if kind != item.kind && kind != ValueKind::Remote {
                return Err(PipelimeError::validation(
                    subject,
                    format!("key '{key}' has kind {kind}, expected {}", item.kind),
                ));
            }
        }
        if !self.allow_extra {
            for key in sample.keys() {
                if !self.items.contains_key(&key) {
                    return Err(PipelimeError::validation(
                        subject,
                        format!("unexpected key '{key}'"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn validate_sequence(&self, sequence: &SampleSequence) -> Result<()> {
        for sample in sequence.iter() {
            self.validate_sample(&sample?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ItemValue;
    use serde_json::json;

    fn make_schema(yaml: &str) -> SampleSchema {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn sample() -> Sample {
        Sample::from_values(
            0u64,
            BTreeMap::from([(
                "metadata".to_string(),
                ItemValue::Metadata(json!({"label": 1})),
            )]),
        )
    }

    #[test]
    fn missing_required_key_fails() {
        let schema = make_schema("items:\n  image:\n    kind: image\n");
        let err = schema.validate_sample(&sample()).unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn kind_mismatch_fails() {
        let schema = make_schema("items:\n  metadata:\n    kind: array\n");
        assert!(schema.validate_sample(&sample()).is_err());
        let schema = make_schema("items:\n  metadata:\n    kind: metadata\n");
        assert!(schema.validate_sample(&sample()).is_ok());
    }

    #[test]
    fn extra_keys_can_be_rejected() {
        let schema = make_schema("items: {}\nallow_extra: false\n");
        assert!(schema.validate_sample(&sample()).is_err());
    }
}
