//! Underfolder reader.
//!
//! Opens a root folder, builds one filesystem sample per id from the
//! underscore-notation tree, attaches public root files to every sample and
//! dispatches the private-plugin files: `_underfolder_links.yml` composes
//! other underfolders by right-biased merge (the opening root wins), and
//! `_stages.yml` attaches a serialized stage to the sequence.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;

use super::{
    layout_error, private_key_of, tree_from_underscore_notation, ReaderTemplate,
    DATA_SUBFOLDER, PRIVATE_KEY_LINKS, PRIVATE_KEY_STAGES,
};
use crate::codec;
use crate::error::{PipelimeError, Result};
use crate::sample::{Sample, SampleId};
use crate::sequence::{SampleSequence, Stage};

#[derive(Debug, Clone)]
pub struct UnderfolderReaderOptions {
    /// Attach public root files to every sample's file map.
    pub copy_root_files: bool,
    /// Decode items on first access instead of at open time.
    pub lazy: bool,
    /// Worker threads for eager loading: 0 sequential, -1 all cores, N>0
    /// that many.
    pub num_workers: i32,
}

impl Default for UnderfolderReaderOptions {
    fn default() -> UnderfolderReaderOptions {
        UnderfolderReaderOptions {
            copy_root_files: true,
            lazy: true,
            num_workers: 0,
        }
    }
}

#[derive(Debug)]
pub struct UnderfolderReader {
    folder: PathBuf,
    options: UnderfolderReaderOptions,
    sequence: SampleSequence,
    root_data: BTreeMap<String, PathBuf>,
    root_keys: BTreeSet<String>,
    private_data: BTreeMap<String, PathBuf>,
    first_id_width: usize,
}

impl UnderfolderReader {
    pub fn open(folder: impl AsRef<Path>) -> Result<UnderfolderReader> {
        Self::open_with_options(folder, UnderfolderReaderOptions::default())
    }

    pub fn open_with_options(
        folder: impl AsRef<Path>,
        options: UnderfolderReaderOptions,
    ) -> Result<UnderfolderReader> {
        let mut visited = BTreeSet::new();
        Self::open_inner(folder.as_ref(), options, &mut visited)
    }

    fn open_inner(
        folder: &Path,
        options: UnderfolderReaderOptions,
        visited: &mut BTreeSet<PathBuf>,
    ) -> Result<UnderfolderReader> {
        let folder = fs::canonicalize(folder)
            .map_err(|err| layout_error(folder, format!("cannot resolve root: {err}")))?;
        if !visited.insert(folder.clone()) {
            return Err(layout_error(&folder, "cycle in underfolder links"));
        }
        let datafolder = folder.join(DATA_SUBFOLDER);
        if !datafolder.is_dir() {
            return Err(layout_error(&folder, "no data folder found"));
        }

        let tree = tree_from_underscore_notation(&datafolder)?;
        let (root_data, root_keys, private_data) = scan_root_files(&folder)?;

        // Keep integer ids only when every id parses as an integer.
        let raw_ids: Vec<&String> = tree.keys().collect();
        let all_int = !raw_ids.is_empty()
            && raw_ids
                .iter()
                .all(|id| matches!(SampleId::parse(id), SampleId::Int(_)));
        let first_id_width = raw_ids.first().map(|id| id.len()).unwrap_or(0);

        let mut samples = Vec::with_capacity(tree.len());
        for (raw_id, files) in &tree {
            let mut files = files.clone();
            if options.copy_root_files {
                for (key, path) in &root_data {
                    files.insert(key.clone(), path.clone());
                }
            }
            let id = if all_int {
                SampleId::parse(raw_id)
            } else {
                SampleId::Str(raw_id.clone())
            };
            samples.push(Sample::from_files(id, files));
        }

        if !options.lazy {
            eager_load(&samples, options.num_workers)?;
        }

        let mut reader = UnderfolderReader {
            folder: folder.clone(),
            options: options.clone(),
            sequence: SampleSequence::new(samples),
            root_data,
            root_keys,
            private_data,
            first_id_width,
        };

        reader.apply_links_plugin(visited)?;
        reader.apply_stages_plugin()?;
        visited.remove(&folder);
        Ok(reader)
    }

    fn apply_links_plugin(&mut self, visited: &mut BTreeSet<PathBuf>) -> Result<()> {
        let Some(links_file) = self.private_data.get(PRIVATE_KEY_LINKS).cloned() else {
            return Ok(());
        };
        let links: Vec<String> = serde_yaml::from_slice(&fs::read(&links_file)?)?;
        let mut samples = self.sequence.raw().to_vec();
        for raw_link in links {
            let link = PathBuf::from(&raw_link);
            if !link.exists() {
                tracing::warn!("skipping dangling underfolder link '{raw_link}'");
                continue;
            }
            let linked =
                UnderfolderReader::open_inner(&link, self.options.clone(), visited)?;
            if linked.len() != samples.len() {
                return Err(layout_error(
                    &self.folder,
                    format!(
                        "linked underfolder '{raw_link}' has {} samples, expected {}",
                        linked.len(),
                        samples.len()
                    ),
                ));
            }
            // Right-biased merge: the accumulated (opening) side wins.
            samples = linked
                .sequence
                .raw()
                .iter()
                .zip(&samples)
                .map(|(left, right)| left.merge(right))
                .collect::<Result<Vec<_>>>()?;
            for (key, path) in &linked.root_data {
                self.root_data.entry(key.clone()).or_insert(path.clone());
            }
            self.root_keys.extend(linked.root_keys.iter().cloned());
        }
        let stage = self.sequence.stage().cloned();
        self.sequence = SampleSequence::with_stage(samples, stage);
        Ok(())
    }

    fn apply_stages_plugin(&mut self) -> Result<()> {
        let Some(stages_file) = self.private_data.get(PRIVATE_KEY_STAGES) else {
            return Ok(());
        };
        let stage: Stage = serde_yaml::from_slice(&fs::read(stages_file)?).map_err(|err| {
            PipelimeError::config(
                format!("{}:{PRIVATE_KEY_STAGES}", self.folder.display()),
                err.to_string(),
            )
        })?;
        let mut sequence = std::mem::take(&mut self.sequence);
        sequence.push_stage(stage);
        self.sequence = sequence;
        Ok(())
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<Sample> {
        self.sequence.get(idx)
    }

    pub fn sequence(&self) -> &SampleSequence {
        &self.sequence
    }

    pub fn into_sequence(self) -> SampleSequence {
        self.sequence
    }

    pub fn is_root_key(&self, key: &str) -> bool {
        self.root_keys.contains(key)
    }

    pub fn is_root_private_key(&self, key: &str) -> bool {
        self.private_data.contains_key(key)
    }

    /// Clear the lazy cache of every sample.
    pub fn flush(&self) {
        for sample in self.sequence.raw() {
            sample.flush();
        }
    }

    /// Introspect sample 0 into the template a writer needs to round-trip
    /// this layout. `None` on an empty dataset.
    pub fn reader_template(&self) -> Option<ReaderTemplate> {
        let sample = self.sequence.raw().first()?;
        let files = sample.files_map()?;
        let extensions_map = files
            .iter()
            .map(|(key, path)| (key.clone(), codec::file_extension(path)))
            .collect();
        Some(ReaderTemplate::new(
            extensions_map,
            self.root_keys.clone(),
            self.first_id_width,
        ))
    }
}

/// Partition `R/*` regular files into public root files and private plugin
/// files; hidden files are dropped.
fn scan_root_files(
    folder: &Path,
) -> Result<(
    BTreeMap<String, PathBuf>,
    BTreeSet<String>,
    BTreeMap<String, PathBuf>,
)> {
    let mut root_data = BTreeMap::new();
    let mut root_keys = BTreeSet::new();
    let mut private_data = BTreeMap::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        match private_key_of(stem) {
            Some(key) => {
                private_data.insert(key.to_string(), path.clone());
            }
            None => {
                root_keys.insert(stem.to_string());
                root_data.insert(stem.to_string(), path.clone());
            }
        }
    }
    Ok((root_data, root_keys, private_data))
}

fn eager_load(samples: &[Sample], num_workers: i32) -> Result<()> {
    let load = |sample: &Sample| -> Result<()> {
        for key in sample.keys() {
            let _ = sample.get(&key)?;
        }
        Ok(())
    };
    if num_workers == 0 {
        for sample in samples {
            load(sample)?;
        }
        return Ok(());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(if num_workers > 0 { num_workers as usize } else { 0 })
        .build()
        .map_err(|err| PipelimeError::Io(format!("cannot build worker pool: {err}")))?;
    pool.install(|| samples.par_iter().try_for_each(load))
}
