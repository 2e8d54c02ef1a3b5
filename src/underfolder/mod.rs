//! The underfolder filesystem dataset layout.
//!
//! ```text
//! R/
//!   data/
//!     <zfill(id,w)>_<key>.<ext>   one file per (sample, item)
//!   <key>.<ext>                   root files, shared across samples
//!   _<priv_key>.<ext>             private plugin files (links, stages)
//! ```
//!
//! Hidden files (leading `.`) are ignored everywhere. Private root files
//! (leading `_`) drive the built-in plugins and are excluded from public
//! iteration.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelimeError, Result};

pub mod convert;
pub mod reader;
pub mod stream;
pub mod writer;

pub use convert::SubfoldersConverter;
pub use reader::{UnderfolderReader, UnderfolderReaderOptions};
pub use stream::{Manifest, UnderfolderStream};
pub use writer::{CopyMode, FileHandling, UnderfolderWriter};

pub const DATA_SUBFOLDER: &str = "data";
pub const PRIVATE_QUALIFIER: &str = "_";
pub const PRIVATE_KEY_LINKS: &str = "underfolder_links";
pub const PRIVATE_KEY_STAGES: &str = "stages";

/// Round-trip layout description: which extension each key uses, which keys
/// are root files, and the fixed width of sample indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderTemplate {
    pub extensions_map: BTreeMap<String, String>,
    pub root_files_keys: BTreeSet<String>,
    pub idx_length: usize,
}

impl ReaderTemplate {
    pub fn new(
        extensions_map: BTreeMap<String, String>,
        root_files_keys: BTreeSet<String>,
        idx_length: usize,
    ) -> ReaderTemplate {
        ReaderTemplate {
            extensions_map,
            root_files_keys,
            idx_length,
        }
    }
}

/// Walk the flat `data/` folder and build the per-sample tree from
/// underscore notation: `<id>_<key>.<ext>` lands in `tree[id][key]`.
/// Hidden files and files lacking an underscore are ignored.
pub fn tree_from_underscore_notation(
    folder: &Path,
) -> Result<BTreeMap<String, BTreeMap<String, PathBuf>>> {
    let mut tree: BTreeMap<String, BTreeMap<String, PathBuf>> = BTreeMap::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem,
            None => continue,
        };
        if stem.starts_with('.') {
            continue;
        }
        let Some((id, key)) = stem.split_once('_') else {
            continue;
        };
        tree.entry(id.to_string())
            .or_default()
            .insert(key.to_string(), path.clone());
    }
    Ok(tree)
}

/// Append `target_root`'s absolute path to `source_root`'s private links
/// file, creating it when absent. The target is not touched; future reads
/// of `source_root` pick up the new link.
pub fn link(source_root: &Path, target_root: &Path) -> Result<()> {
    let links_file = source_root.join(format!(
        "{PRIVATE_QUALIFIER}{PRIVATE_KEY_LINKS}.yml"
    ));
    let mut links: Vec<String> = if links_file.exists() {
        serde_yaml::from_slice(&fs::read(&links_file)?)?
    } else {
        Vec::new()
    };
    let target = fs::canonicalize(target_root)?;
    links.push(target.to_string_lossy().into_owned());
    fs::write(&links_file, serde_yaml::to_string(&links)?)?;
    Ok(())
}

/// Strip the private qualifier from a root-file stem.
pub(crate) fn private_key_of(stem: &str) -> Option<&str> {
    stem.strip_prefix(PRIVATE_QUALIFIER)
}

pub(crate) fn layout_error(folder: &Path, reason: impl Into<String>) -> PipelimeError {
    PipelimeError::Layout(format!("{}: {}", folder.display(), reason.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_scan_partitions_ids_and_keys() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [
            "00_image.png",
            "00_label.txt",
            "01_image.png",
            ".hidden.png",
            "stray.png",
        ] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let tree = tree_from_underscore_notation(tmp.path()).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(
            tree["00"].keys().cloned().collect::<Vec<_>>(),
            vec!["image".to_string(), "label".to_string()]
        );
        assert!(!tree.contains_key("stray"));
    }

    #[test]
    fn link_appends_to_the_manifest() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        link(source.path(), target.path()).unwrap();
        link(source.path(), target.path()).unwrap();
        let links: Vec<String> = serde_yaml::from_slice(
            &fs::read(source.path().join("_underfolder_links.yml")).unwrap(),
        )
        .unwrap();
        assert_eq!(links.len(), 2);
    }
}
