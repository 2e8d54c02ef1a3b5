//! Per-sample transformation stages.
//!
//! A stage is a pure `Sample -> Sample` function attached to a sequence and
//! applied on access. Stages are serde-tagged so pipelines can be described
//! in configuration files; unknown tags fail at load time, not at apply
//! time. Composition is left-to-right.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{PipelimeError, Result};
use crate::remote::{self, RemoteUrl};
use crate::sample::Sample;
use crate::value::ItemValue;

/// Hook for the external augmentation library. The library itself is a
/// collaborator, not part of this crate: programs register an implementation
/// and the [`Stage::Augmentation`] variant delegates to it.
pub trait AugmentationBackend: Send + Sync {
    fn transform(
        &self,
        config: &serde_json::Value,
        targets: BTreeMap<String, ItemValue>,
    ) -> Result<BTreeMap<String, ItemValue>>;
}

static AUGMENTATION_BACKEND: Lazy<RwLock<Option<Arc<dyn AugmentationBackend>>>> =
    Lazy::new(|| RwLock::new(None));

pub fn set_augmentation_backend(backend: Arc<dyn AugmentationBackend>) {
    *AUGMENTATION_BACKEND.write() = Some(backend);
}

/// One target remote of [`Stage::UploadToRemote`], as parsed from
/// `<scheme>://<netloc>/<base_path>[?k=v:k=v...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub scheme: String,
    pub netloc: String,
    pub base_path: String,
    #[serde(default)]
    pub init_args: BTreeMap<String, serde_json::Value>,
}

impl RemoteSpec {
    /// Parse a remote descriptor URL; the whole path is the base path.
    pub fn parse(url: &str) -> Result<RemoteSpec> {
        // Reuse the url parser by appending a fake blob name.
        let probe = format!("{}/__name__", url.split('?').next().unwrap_or(url));
        let query = url.split_once('?').map(|(_, q)| q);
        let parsed = RemoteUrl::parse(&match query {
            Some(q) => format!("{probe}?{q}"),
            None => probe,
        })?;
        Ok(RemoteSpec {
            scheme: parsed.scheme,
            netloc: parsed.netloc,
            base_path: parsed.base_path,
            init_args: parsed.init_args,
        })
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stage {
    Identity,
    /// Keep only `keys` (or drop them when `negate`).
    KeyFilter {
        keys: Vec<String>,
        #[serde(default)]
        negate: bool,
    },
    /// Rename keys; unmapped keys are dropped unless `remove_missing` is
    /// cleared.
    KeyRemap {
        remap: BTreeMap<String, String>,
        #[serde(default = "default_true")]
        remove_missing: bool,
    },
    /// Left-to-right composition.
    Compose { stages: Vec<Stage> },
    /// Opaque image-transform config delegated to the registered
    /// augmentation backend. `targets` maps sample keys to the backend's
    /// target roles.
    Augmentation {
        transform: serde_json::Value,
        targets: BTreeMap<String, String>,
    },
    /// Encode each target key with its source extension, upload the payload
    /// to every remote in order and replace the in-sample value with the
    /// list of resulting URLs.
    UploadToRemote {
        remotes: Vec<RemoteSpec>,
        key_ext_map: BTreeMap<String, String>,
    },
}

impl Stage {
    pub fn apply(&self, sample: &Sample) -> Result<Sample> {
        match self {
            Stage::Identity => Ok(sample.copy()),
            Stage::KeyFilter { keys, negate } => {
                let mut out = sample.copy();
                for key in sample.keys() {
                    let listed = keys.iter().any(|k| k == &key);
                    if listed == *negate {
                        out.delete(&key);
                    }
                }
                Ok(out)
            }
            Stage::KeyRemap {
                remap,
                remove_missing,
            } => {
                let mut out = sample.copy();
                for key in sample.keys() {
                    match remap.get(&key) {
                        Some(new_key) => out.rename(&key, new_key),
                        None => {
                            if *remove_missing {
                                out.delete(&key);
                            }
                        }
                    }
                }
                Ok(out)
            }
            Stage::Compose { stages } => {
                let mut out = sample.copy();
                for stage in stages {
                    out = stage.apply(&out)?;
                }
                Ok(out)
            }
            Stage::Augmentation { transform, targets } => {
                let backend = AUGMENTATION_BACKEND.read().clone().ok_or_else(|| {
                    PipelimeError::config(
                        "stage.augmentation",
                        "no augmentation backend registered",
                    )
                })?;
                let mut inputs = BTreeMap::new();
                for key in targets.keys() {
                    if sample.contains(key) {
                        inputs.insert(key.clone(), sample.get(key)?);
                    }
                }
                let transformed = backend.transform(transform, inputs)?;
                let mut out = sample.copy();
                for (key, value) in transformed {
                    out.set(&key, value);
                }
                Ok(out)
            }
            Stage::UploadToRemote {
                remotes,
                key_ext_map,
            } => upload_to_remotes(sample, remotes, key_ext_map),
        }
    }

    /// Compose two optional stages into one, first then second.
    pub fn compose_opt(first: Option<Arc<Stage>>, second: Option<Arc<Stage>>) -> Option<Arc<Stage>> {
        match (first, second) {
            (None, second) => second,
            (first, None) => first,
            (Some(first), Some(second)) => Some(Arc::new(Stage::Compose {
                stages: vec![(*first).clone(), (*second).clone()],
            })),
        }
    }
}

fn upload_to_remotes(
    sample: &Sample,
    remotes: &[RemoteSpec],
    key_ext_map: &BTreeMap<String, String>,
) -> Result<Sample> {
    let mut out = sample.copy();
    for (key, extension) in key_ext_map {
        if !sample.contains(key) {
            continue;
        }
        let value = sample.get(key)?;
        let payload = codec::encode_bytes(&value, extension)?;
        let size = payload.len() as u64;
        let suffix = format!(".{extension}");

        let mut urls = Vec::new();
        for spec in remotes {
            let remote = remote::create_remote(&spec.scheme, &spec.netloc, &spec.init_args);
            let mut stream = Cursor::new(payload.as_slice());
            match remote.upload_stream(&mut stream, size, &spec.base_path, &suffix) {
                Some(url) => urls.push(url),
                None => tracing::warn!(
                    "upload of '{key}' to {}://{}/{} failed, omitting url",
                    spec.scheme,
                    spec.netloc,
                    spec.base_path
                ),
            }
        }
        if urls.is_empty() {
            return Err(PipelimeError::RemoteUnreachable(format!(
                "no remote accepted the payload for key '{key}'"
            )));
        }
        out.set(key, ItemValue::RemoteList(urls));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Sample {
        Sample::from_values(
            0u64,
            BTreeMap::from([
                ("a".to_string(), ItemValue::Metadata(json!(1))),
                ("b".to_string(), ItemValue::Metadata(json!(2))),
            ]),
        )
    }

    #[test]
    fn key_filter_keeps_and_negates() {
        let keep = Stage::KeyFilter {
            keys: vec!["a".to_string()],
            negate: false,
        };
        let out = keep.apply(&sample()).unwrap();
        assert_eq!(out.keys(), vec!["a".to_string()]);

        let drop = Stage::KeyFilter {
            keys: vec!["a".to_string()],
            negate: true,
        };
        let out = drop.apply(&sample()).unwrap();
        assert_eq!(out.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn key_remap_honors_remove_missing() {
        let stage = Stage::KeyRemap {
            remap: BTreeMap::from([("a".to_string(), "z".to_string())]),
            remove_missing: true,
        };
        let out = stage.apply(&sample()).unwrap();
        assert_eq!(out.keys(), vec!["z".to_string()]);

        let stage = Stage::KeyRemap {
            remap: BTreeMap::from([("a".to_string(), "z".to_string())]),
            remove_missing: false,
        };
        let out = stage.apply(&sample()).unwrap();
        assert_eq!(out.keys(), vec!["b".to_string(), "z".to_string()]);
    }

    #[test]
    fn stages_roundtrip_through_yaml() {
        let stage = Stage::Compose {
            stages: vec![
                Stage::Identity,
                Stage::KeyFilter {
                    keys: vec!["image".to_string()],
                    negate: false,
                },
            ],
        };
        let text = serde_yaml::to_string(&stage).unwrap();
        let back: Stage = serde_yaml::from_str(&text).unwrap();
        let out = back.apply(&sample()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_stage_tag_fails_to_load() {
        let err = serde_yaml::from_str::<Stage>("type: warp_drive").unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn remote_spec_parses_base_path_and_args() {
        let spec = RemoteSpec::parse("file://localhost/tmp/datalake?create=True").unwrap();
        assert_eq!(spec.scheme, "file");
        assert_eq!(spec.base_path, "tmp/datalake");
        assert_eq!(spec.init_args["create"], json!(true));
    }
}
