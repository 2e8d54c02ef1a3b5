//! Local-filesystem remote backend (`file://` scheme).
//!
//! A bucket is a directory tree rooted at `/<netloc>/<base_path>` (netloc is
//! empty for localhost). Bucket metadata, including the hash algorithm,
//! lives in `<base>/.pl/tags.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{HashAlgorithm, ReadSeek, Remote, DEFAULT_HASH_FN, HASH_FN_KEY};

const PL_FOLDER: &str = ".pl";
const TAGS_FILE: &str = "tags.json";

pub struct FileRemote {
    netloc: String,
}

impl FileRemote {
    pub fn new(netloc: &str) -> FileRemote {
        let netloc = match netloc {
            "localhost" | "127.0.0.1" => "",
            other => other,
        };
        FileRemote {
            netloc: netloc.to_string(),
        }
    }

    fn make_path(&self, base_path: &str, name: &str) -> PathBuf {
        let mut path = PathBuf::from("/");
        if !self.netloc.is_empty() {
            path.push(&self.netloc);
        }
        path.push(base_path);
        if !name.is_empty() {
            path.push(name);
        }
        path
    }

    fn ensure_root(&self, root: &Path) -> io::Result<()> {
        let pldir = root.join(PL_FOLDER);
        if !pldir.is_dir() {
            tracing::info!("Creating folder tree {}.", root.display());
            fs::create_dir_all(&pldir)?;
        }
        Ok(())
    }

    fn read_tags(&self, root: &Path) -> BTreeMap<String, String> {
        fs::read(root.join(PL_FOLDER).join(TAGS_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn write_tags(&self, root: &Path, tags: &BTreeMap<String, String>) -> io::Result<()> {
        let payload = serde_json::to_vec(tags).expect("string map serializes");
        fs::write(root.join(PL_FOLDER).join(TAGS_FILE), payload)
    }
}

impl Remote for FileRemote {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn netloc(&self) -> &str {
        &self.netloc
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn hash_algorithm(&self, base_path: &str) -> Option<HashAlgorithm> {
        let root = self.make_path(base_path, "");
        if let Err(err) = self.ensure_root(&root) {
            tracing::warn!("cannot create bucket '{}': {err}", root.display());
            return None;
        }
        let tags = self.read_tags(&root);
        if let Some(algorithm) = tags.get(HASH_FN_KEY).and_then(|n| HashAlgorithm::parse(n)) {
            return Some(algorithm);
        }
        // First upload into this bucket: persist the default, then re-read
        // so a concurrent first-uploader's write wins consistently.
        let mut tags = tags;
        tags.insert(HASH_FN_KEY.to_string(), DEFAULT_HASH_FN.to_string());
        if let Err(err) = self.write_tags(&root, &tags) {
            tracing::warn!("cannot persist bucket tags in '{}': {err}", root.display());
            return None;
        }
        let tags = self.read_tags(&root);
        tags.get(HASH_FN_KEY)
            .and_then(|n| HashAlgorithm::parse(n))
            .or(Some(HashAlgorithm::Sha256))
    }

    fn put(&self, payload: &mut dyn ReadSeek, _size: u64, base_path: &str, name: &str) -> bool {
        let target = self.make_path(base_path, name);
        if let Some(parent) = target.parent() {
            if let Err(err) = self.ensure_root(parent) {
                tracing::warn!("cannot create bucket '{}': {err}", parent.display());
                return false;
            }
        }
        let result = fs::File::create(&target)
            .and_then(|mut sink| io::copy(payload, &mut sink).map(|_| ()));
        if let Err(err) = result {
            tracing::warn!("upload to '{}' failed: {err}", target.display());
            return false;
        }
        true
    }

    fn get(&self, sink: &mut dyn Write, base_path: &str, name: &str, offset: u64) -> bool {
        let source = self.make_path(base_path, name);
        if !source.exists() {
            tracing::warn!("File {} does not exist.", source.display());
            return false;
        }
        let result = fs::File::open(&source).and_then(|mut stream| {
            stream.seek(SeekFrom::Start(offset))?;
            io::copy(&mut stream, sink).map(|_| ())
        });
        if let Err(err) = result {
            tracing::warn!("download from '{}' failed: {err}", source.display());
            return false;
        }
        true
    }
}
