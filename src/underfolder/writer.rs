//! Underfolder writer.
//!
//! Writes a sequence into the underfolder layout, driven by a
//! [`ReaderTemplate`]: keys map to extensions, root keys are written once
//! (first writer wins), integer ids are zero-padded to
//! `max(template width, best_zfill)`. File handling follows the policy
//! matrix below; copy transfers happen as deep copies, symlinks or
//! hardlinks.
//!
//! | policy                 | behavior when the item backs a file with a matching suffix |
//! |------------------------|-----------------------------------------------------------|
//! | AlwaysWriteFromCache   | always codec-encode the in-memory value                    |
//! | AlwaysCopyFromDisk     | always transfer the underlying file                        |
//! | CopyIfNotCached        | transfer unless the value was loaded into cache            |
//!
//! Keys in `force_copy_keys` always follow the copy path when the suffix
//! matches. A failed sample write aborts the whole write; already-written
//! files are not rolled back.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rayon::prelude::*;

use super::{ReaderTemplate, DATA_SUBFOLDER};
use crate::codec;
use crate::error::{PipelimeError, Result};
use crate::sample::{ItemSource, Sample, SampleId};
use crate::sequence::SampleSequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileHandling {
    AlwaysWriteFromCache,
    AlwaysCopyFromDisk,
    #[default]
    CopyIfNotCached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    #[default]
    DeepCopy,
    Symlink,
    Hardlink,
}

pub struct UnderfolderWriter {
    folder: PathBuf,
    datafolder: PathBuf,
    template: ReaderTemplate,
    file_handling: FileHandling,
    copy_mode: CopyMode,
    force_copy_keys: BTreeSet<String>,
    remove_duplicates: bool,
    num_workers: i32,
    saved_root_keys: Mutex<HashSet<String>>,
}

impl UnderfolderWriter {
    pub fn new(folder: impl AsRef<Path>, template: ReaderTemplate) -> Result<UnderfolderWriter> {
        let folder = folder.as_ref().to_path_buf();
        let datafolder = folder.join(DATA_SUBFOLDER);
        fs::create_dir_all(&datafolder)?;

        let copy_mode = CopyMode::default();
        Ok(UnderfolderWriter {
            folder,
            datafolder,
            template,
            file_handling: FileHandling::default(),
            copy_mode,
            force_copy_keys: BTreeSet::new(),
            remove_duplicates: false,
            num_workers: 0,
            saved_root_keys: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_file_handling(mut self, file_handling: FileHandling) -> UnderfolderWriter {
        self.file_handling = file_handling;
        self
    }

    pub fn with_copy_mode(mut self, copy_mode: CopyMode) -> UnderfolderWriter {
        self.copy_mode = copy_mode;
        if self.copy_mode == CopyMode::Symlink && !cfg!(unix) {
            tracing::warn!("Symlink is not supported on this platform, switching to deep copy");
            self.copy_mode = CopyMode::DeepCopy;
        }
        self
    }

    pub fn with_force_copy_keys(
        mut self,
        keys: impl IntoIterator<Item = String>,
    ) -> UnderfolderWriter {
        self.force_copy_keys = keys.into_iter().collect();
        self
    }

    pub fn with_remove_duplicates(mut self, remove_duplicates: bool) -> UnderfolderWriter {
        self.remove_duplicates = remove_duplicates;
        self
    }

    /// 0 sequential, -1 all cores, N>0 that many worker threads.
    pub fn with_num_workers(mut self, num_workers: i32) -> UnderfolderWriter {
        self.num_workers = num_workers;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Write every sample of the sequence (stage applied).
    pub fn write(&self, sequence: &SampleSequence) -> Result<()> {
        let zfill = self.template.idx_length.max(sequence.best_zfill());
        self.saved_root_keys.lock().clear();

        if self.num_workers == 0 {
            for sample in sequence.iter() {
                self.process_sample(&sample?, zfill)?;
            }
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(if self.num_workers > 0 {
                self.num_workers as usize
            } else {
                0
            })
            .build()
            .map_err(|err| PipelimeError::Io(format!("cannot build worker pool: {err}")))?;
        pool.install(|| {
            (0..sequence.len()).into_par_iter().try_for_each(|idx| {
                let sample = sequence.get(idx)?;
                self.process_sample(&sample, zfill)
            })
        })
    }

    fn basename(&self, sample: &Sample, zfill: usize) -> Result<String> {
        match sample.id() {
            Some(SampleId::Int(n)) => Ok(format!("{n:0zfill$}")),
            Some(SampleId::Str(s)) => Ok(s.clone()),
            None => Err(PipelimeError::validation(
                "underfolder write",
                "sample has no id",
            )),
        }
    }

    fn item_extension(&self, sample: &Sample, key: &str) -> Result<String> {
        if let Some(ext) = self.template.extensions_map.get(key) {
            return Ok(ext.clone());
        }
        Err(PipelimeError::codec(
            key,
            "",
            format!(
                "no extension mapped for key '{key}' of sample {}",
                sample
                    .id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".to_string())
            ),
        ))
    }

    fn process_sample(&self, sample: &Sample, zfill: usize) -> Result<()> {
        let basename = self.basename(sample, zfill)?;
        for key in sample.keys() {
            let extension = self.item_extension(sample, &key)?;
            if self.template.root_files_keys.contains(&key) {
                // Root files are written at most once; first writer wins.
                if !self.saved_root_keys.lock().insert(key.clone()) {
                    continue;
                }
                let output = self.folder.join(format!("{key}.{extension}"));
                self.write_item(&output, sample, &key)?;
            } else {
                let output = self.datafolder.join(format!("{basename}_{key}.{extension}"));
                if self.remove_duplicates {
                    self.remove_duplicate_files(&output)?;
                }
                self.write_item(&output, sample, &key)?;
            }
        }
        Ok(())
    }

    /// Delete sibling files sharing the stem but carrying another suffix.
    /// Confined to the data folder; root files are never touched.
    fn remove_duplicate_files(&self, output: &Path) -> Result<()> {
        let Some(stem) = output.file_stem().and_then(|s| s.to_str()) else {
            return Ok(());
        };
        for entry in fs::read_dir(&self.datafolder)? {
            let path = entry?.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(stem)
                && path.extension() != output.extension()
            {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn write_item(&self, output: &Path, sample: &Sample, key: &str) -> Result<()> {
        if self.file_handling != FileHandling::AlwaysWriteFromCache {
            if let ItemSource::File(path) = sample.metaitem(key) {
                let same_suffix = path.extension() == output.extension();
                let copy_wanted = self.file_handling == FileHandling::AlwaysCopyFromDisk
                    || self.force_copy_keys.contains(key)
                    || !sample.is_cached(key);
                if same_suffix && copy_wanted {
                    return self.transfer_file(&path, output);
                }
            }
        }
        let value = sample.get(key)?;
        codec::store_item(output, &value)
    }

    fn transfer_file(&self, source: &Path, output: &Path) -> Result<()> {
        // In-place writes happen when a reader and a writer share the root;
        // compare resolved paths so the file is never deleted from under
        // itself.
        if source == output
            || (output.exists()
                && fs::canonicalize(source).ok() == fs::canonicalize(output).ok())
        {
            return Ok(());
        }
        if output.exists() {
            fs::remove_file(output)?;
        }
        match self.copy_mode {
            CopyMode::DeepCopy => {
                fs::copy(source, output)?;
            }
            CopyMode::Symlink => {
                #[cfg(unix)]
                std::os::unix::fs::symlink(source, output)?;
                #[cfg(not(unix))]
                fs::copy(source, output).map(|_| ())?;
            }
            CopyMode::Hardlink => {
                fs::hard_link(source, output)?;
            }
        }
        Ok(())
    }
}
