//! Subfolder-tree to underfolder conversion.
//!
//! Turns a category tree of images
//!
//! ```text
//! root/
//!   cats/indoor/a.png
//!   cats/b.png
//!   dogs/c.png
//! ```
//!
//! into a flat underfolder where every sample carries the image, a
//! `metadata` item with its category (the sanitized relative subfolder
//! path) and filename, and a shared `classmap` root file listing every
//! category.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{CopyMode, ReaderTemplate, UnderfolderWriter};
use crate::codec;
use crate::error::{PipelimeError, Result};
use crate::sample::Sample;
use crate::sequence::SampleSequence;
use crate::value::ItemValue;

const REPLACE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '-', ' '];

/// Sanitize a relative subfolder path into a category name.
fn purge_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_sep = false;
    for c in s.chars() {
        if REPLACE_CHARS.contains(&c) || c.is_whitespace() {
            if !last_was_sep && !out.is_empty() {
                out.push('_');
            }
            last_was_sep = true;
        } else {
            out.push(c);
            last_was_sep = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

pub struct SubfoldersConverter {
    folder: PathBuf,
    images_extension: String,
    copy_mode: CopyMode,
    num_workers: i32,
    items: Vec<(PathBuf, String)>,
    classmap: Vec<String>,
}

impl SubfoldersConverter {
    pub fn new(folder: impl AsRef<Path>, images_extension: &str) -> Result<SubfoldersConverter> {
        let folder = folder.as_ref().to_path_buf();
        if !folder.is_dir() {
            return Err(PipelimeError::NotFound(format!(
                "source folder '{}'",
                folder.display()
            )));
        }
        let mut items = Vec::new();
        let mut classmap = BTreeSet::new();
        for entry in WalkDir::new(&folder).min_depth(2).sort_by_file_name() {
            let entry = entry.map_err(|err| PipelimeError::Io(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if codec::file_extension(entry.path()) != images_extension {
                continue;
            }
            let relative = entry
                .path()
                .parent()
                .and_then(|p| p.strip_prefix(&folder).ok())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let category = purge_string(&relative);
            classmap.insert(category.clone());
            items.push((entry.path().to_path_buf(), category));
        }
        Ok(SubfoldersConverter {
            folder,
            images_extension: images_extension.to_string(),
            copy_mode: CopyMode::DeepCopy,
            num_workers: 0,
            items,
            classmap: classmap.into_iter().collect(),
        })
    }

    pub fn with_copy_mode(mut self, copy_mode: CopyMode) -> SubfoldersConverter {
        self.copy_mode = copy_mode;
        self
    }

    pub fn with_num_workers(mut self, num_workers: i32) -> SubfoldersConverter {
        self.num_workers = num_workers;
        self
    }

    pub fn source_folder(&self) -> &Path {
        &self.folder
    }

    /// Categories discovered in the tree, sorted.
    pub fn classmap(&self) -> &[String] {
        &self.classmap
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build the samples and write the underfolder.
    pub fn convert(&self, output_folder: impl AsRef<Path>) -> Result<()> {
        let classmap = ItemValue::Metadata(serde_json::json!({ "names": self.classmap }));
        let mut samples = Vec::with_capacity(self.items.len());
        for (index, (path, category)) in self.items.iter().enumerate() {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut sample = Sample::from_files(
                index as u64,
                BTreeMap::from([("image".to_string(), path.clone())]),
            );
            sample.set(
                "metadata",
                ItemValue::Metadata(serde_json::json!({
                    "category": category,
                    "filename": filename,
                })),
            );
            sample.set("classmap", classmap.clone());
            samples.push(sample);
        }

        let template = ReaderTemplate::new(
            BTreeMap::from([
                ("image".to_string(), self.images_extension.clone()),
                ("metadata".to_string(), "yml".to_string()),
                ("classmap".to_string(), "yml".to_string()),
            ]),
            BTreeSet::from(["classmap".to_string()]),
            1,
        );
        UnderfolderWriter::new(output_folder, template)?
            .with_copy_mode(self.copy_mode)
            .with_num_workers(self.num_workers)
            .write(&SampleSequence::new(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::underfolder::UnderfolderReader;
    use crate::value::lookup_value;

    fn touch_png(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::DynamicImage::new_rgb8(2, 2)
            .save_with_format(path, image::ImageFormat::Png)
            .unwrap();
    }

    #[test]
    fn purge_collapses_separators() {
        assert_eq!(purge_string("cats/indoor"), "cats_indoor");
        assert_eq!(purge_string("a - b/c"), "a_b_c");
    }

    #[test]
    fn conversion_builds_a_readable_underfolder() {
        let src = tempfile::tempdir().unwrap();
        touch_png(&src.path().join("cats").join("a.png"));
        touch_png(&src.path().join("cats").join("indoor").join("b.png"));
        touch_png(&src.path().join("dogs").join("c.png"));
        // Non-image and hidden files are skipped.
        std::fs::write(src.path().join("cats").join("notes.txt"), "x").unwrap();
        std::fs::write(src.path().join("dogs").join(".hidden.png"), "x").unwrap();

        let converter = SubfoldersConverter::new(src.path(), "png").unwrap();
        assert_eq!(converter.len(), 3);
        assert_eq!(
            converter.classmap(),
            &["cats".to_string(), "cats_indoor".to_string(), "dogs".to_string()]
        );

        let out = tempfile::tempdir().unwrap();
        converter.convert(out.path()).unwrap();

        let reader = UnderfolderReader::open(out.path()).unwrap();
        assert_eq!(reader.len(), 3);
        assert!(reader.is_root_key("classmap"));
        let sample = reader.get(0).unwrap();
        let metadata = sample.get("metadata").unwrap();
        let category = metadata
            .as_metadata()
            .and_then(|m| lookup_value(m, "category"))
            .cloned();
        assert_eq!(category, Some(serde_json::json!("cats")));
    }
}
