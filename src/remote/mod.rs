//! Content-addressed remote storage.
//!
//! A [`Remote`] is a blob store reachable at `(scheme, netloc)`. Uploads are
//! named by the hex digest of their content (algorithm chosen per bucket and
//! persisted in the bucket metadata), so re-uploading identical bytes is
//! idempotent. Downloads are resumable through `.part` sibling files.
//!
//! Instances live in a process-wide registry populated lazily on first
//! [`create_remote`]; the registry is read-mostly after that. Unknown
//! schemes resolve to a null remote that logs a warning and declines every
//! operation.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::Md5;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use sha2::{Digest, Sha256, Sha512};
use url::Url;

use crate::error::{PipelimeError, Result};

pub mod file;
pub mod s3;

pub use file::FileRemote;
pub use s3::S3Remote;

/// Key of the hash-function entry in bucket metadata (`tags.json` for the
/// file backend, the bucket metadata object for S3).
pub const HASH_FN_KEY: &str = "__HASH_FN__";
pub const DEFAULT_HASH_FN: &str = "sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Md5,
}

impl HashAlgorithm {
    pub fn parse(name: &str) -> Option<HashAlgorithm> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            "md5" => Some(HashAlgorithm::Md5),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Md5 => "md5",
        }
    }
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Digest the remainder of `stream` and rewind it to where it started.
pub fn hash_stream(stream: &mut dyn ReadSeek, algorithm: HashAlgorithm) -> Result<String> {
    fn digest_with<D: Digest>(stream: &mut dyn ReadSeek) -> Result<String> {
        let mut hasher = D::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    let start = stream.stream_position()?;
    let digest = match algorithm {
        HashAlgorithm::Sha256 => digest_with::<Sha256>(stream)?,
        HashAlgorithm::Sha512 => digest_with::<Sha512>(stream)?,
        HashAlgorithm::Md5 => digest_with::<Md5>(stream)?,
    };
    stream.seek(SeekFrom::Start(start))?;
    Ok(digest)
}

/// Parsed remote URL:
/// `<scheme>://<netloc>/<base_path>/<name>[?k=v:k=v...]`.
///
/// Query values of the forms `True`/`False`, decimal integers and decimal
/// floats decode to their native types; everything else stays a string.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUrl {
    pub scheme: String,
    pub netloc: String,
    pub base_path: String,
    pub name: String,
    pub init_args: BTreeMap<String, serde_json::Value>,
}

fn convert_query_value(raw: &str) -> serde_json::Value {
    match raw {
        "True" => return serde_json::Value::Bool(true),
        "False" => return serde_json::Value::Bool(false),
        _ => {}
    }
    if let Ok(num) = raw.parse::<i64>() {
        return serde_json::Value::Number(num.into());
    }
    if let Ok(num) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(num) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

impl RemoteUrl {
    pub fn parse(url: &str) -> Result<RemoteUrl> {
        let parsed = Url::parse(url)?;
        let mut netloc = parsed.host_str().unwrap_or_default().to_string();
        if let Some(port) = parsed.port() {
            netloc = format!("{netloc}:{port}");
        }
        let path = percent_decode(parsed.path());
        let path = path.trim_start_matches('/');
        let (base_path, name) = match path.rsplit_once('/') {
            Some((base, name)) => (base.to_string(), name.to_string()),
            None => {
                return Err(PipelimeError::Remote(format!(
                    "remote url '{url}' has no base path"
                )))
            }
        };
        let mut init_args = BTreeMap::new();
        if let Some(query) = parsed.query() {
            for pair in query.split(':') {
                if let Some((k, v)) = pair.split_once('=') {
                    if !k.is_empty() {
                        init_args.insert(k.to_string(), convert_query_value(v));
                    }
                }
            }
        }
        Ok(RemoteUrl {
            scheme: parsed.scheme().to_string(),
            netloc,
            base_path,
            name,
            init_args,
        })
    }
}

/// Url keeps the path percent-encoded; undo it for filesystem use.
fn percent_decode(path: &str) -> String {
    let mut bytes = path.bytes();
    let mut decoded: Vec<u8> = Vec::with_capacity(path.len());
    while let Some(b) = bytes.next() {
        if b == b'%' {
            if let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) {
                if let (Some(h), Some(l)) = ((hi as char).to_digit(16), (lo as char).to_digit(16)) {
                    decoded.push((h * 16 + l) as u8);
                    continue;
                }
            }
        }
        decoded.push(b);
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Capability set of a content-addressed blob backend.
///
/// Upload/download return `Option`/`bool` rather than errors: a failing
/// remote is a local, recoverable decision (the caller may try the next
/// remote in its list), and backends log the cause themselves.
pub trait Remote: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn netloc(&self) -> &str;

    fn is_valid(&self) -> bool;

    /// The hash algorithm configured for `base_path`, creating the bucket
    /// metadata with the default algorithm when unset.
    fn hash_algorithm(&self, base_path: &str) -> Option<HashAlgorithm>;

    /// Store `payload` under `base_path/name`. The stream is positioned at
    /// the payload start.
    fn put(
        &self,
        payload: &mut dyn ReadSeek,
        size: u64,
        base_path: &str,
        name: &str,
    ) -> bool;

    /// Stream `base_path/name` starting at `offset` into `sink`.
    fn get(&self, sink: &mut dyn Write, base_path: &str, name: &str, offset: u64) -> bool;

    /// Hash the stream, then store it as `<hexdigest><suffix>`. Returns the
    /// URL of the stored blob, or `None` when the upload failed.
    fn upload_stream(
        &self,
        stream: &mut dyn ReadSeek,
        size: u64,
        base_path: &str,
        suffix: &str,
    ) -> Option<String> {
        let algorithm = self.hash_algorithm(base_path)?;
        let digest = match hash_stream(stream, algorithm) {
            Ok(digest) => digest,
            Err(err) => {
                tracing::warn!("hashing upload payload failed: {err}");
                return None;
            }
        };
        let name = format!("{digest}{suffix}");
        if self.put(stream, size, base_path, &name) {
            Some(make_url(self.scheme(), self.netloc(), base_path, &name))
        } else {
            None
        }
    }

    fn download_stream(
        &self,
        sink: &mut dyn Write,
        base_path: &str,
        name: &str,
        offset: u64,
    ) -> bool {
        self.get(sink, base_path, name, offset)
    }

    /// Upload a local file; the target suffix is the file's own suffix.
    fn upload_file(&self, local_file: &Path, base_path: &str) -> Option<String> {
        let size = match fs::metadata(local_file) {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::warn!("cannot stat '{}': {err}", local_file.display());
                return None;
            }
        };
        let suffix = local_file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut stream = match fs::File::open(local_file) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!("cannot open '{}': {err}", local_file.display());
                return None;
            }
        };
        self.upload_stream(&mut stream, size, base_path, &suffix)
    }

    /// Resumable download to a local file.
    ///
    /// Data lands in a `<file>.part` sibling first; when that file already
    /// exists its length becomes the transfer offset, so only the missing
    /// suffix moves. On success the part file is atomically renamed.
    fn download_file(&self, local_file: &Path, base_path: &str, name: &str) -> bool {
        let mut target = local_file.to_path_buf();
        let source_suffix = Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let target_suffix = target
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        if target_suffix != source_suffix && !source_suffix.is_empty() {
            target = PathBuf::from(format!("{}{}", target.display(), source_suffix));
        }
        if let Some(parent) = target.parent() {
            if fs::create_dir_all(parent).is_err() {
                return false;
            }
        }

        let part_file = PathBuf::from(format!("{}.part", target.display()));
        let offset = fs::metadata(&part_file).map(|m| m.len()).unwrap_or(0);

        let ok = match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_file)
        {
            Ok(mut part_stream) => self.get(&mut part_stream, base_path, name, offset),
            Err(err) => {
                tracing::warn!("cannot open part file '{}': {err}", part_file.display());
                false
            }
        };
        if ok {
            let _ = fs::remove_file(&target);
            if let Err(err) = fs::rename(&part_file, &target) {
                tracing::warn!("cannot finalize '{}': {err}", target.display());
                return false;
            }
        }
        ok
    }
}

pub fn make_url(scheme: &str, netloc: &str, base_path: &str, name: &str) -> String {
    let mut url = Url::parse(&format!("{scheme}://{netloc}"))
        .unwrap_or_else(|_| Url::parse("file://").expect("static url parses"));
    url.set_path(&format!("/{}/{}", base_path.trim_start_matches('/'), name));
    url.to_string()
}

/// Process-wide `(scheme, netloc) -> Remote` registry. Populated lazily,
/// read-only afterwards.
static REMOTES: Lazy<RwLock<HashMap<(String, String), Arc<dyn Remote>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Null backend standing in for unknown schemes: declines everything.
struct NullRemote {
    netloc: String,
}

impl Remote for NullRemote {
    fn scheme(&self) -> &'static str {
        "null"
    }

    fn netloc(&self) -> &str {
        &self.netloc
    }

    fn is_valid(&self) -> bool {
        false
    }

    fn hash_algorithm(&self, _base_path: &str) -> Option<HashAlgorithm> {
        None
    }

    fn put(&self, _: &mut dyn ReadSeek, _: u64, _: &str, _: &str) -> bool {
        false
    }

    fn get(&self, _: &mut dyn Write, _: &str, _: &str, _: u64) -> bool {
        false
    }
}

/// Fetch or lazily build the remote serving `(scheme, netloc)`.
pub fn create_remote(
    scheme: &str,
    netloc: &str,
    init_args: &BTreeMap<String, serde_json::Value>,
) -> Arc<dyn Remote> {
    let key = (scheme.to_string(), netloc.to_string());
    if let Some(remote) = REMOTES.read().get(&key) {
        return Arc::clone(remote);
    }
    let remote: Arc<dyn Remote> = match scheme {
        "file" => Arc::new(FileRemote::new(netloc)),
        "s3" => Arc::new(S3Remote::new(netloc, init_args)),
        other => {
            tracing::warn!("Unknown remote scheme '{other}'.");
            Arc::new(NullRemote {
                netloc: netloc.to_string(),
            })
        }
    };
    let mut registry = REMOTES.write();
    Arc::clone(registry.entry(key).or_insert(remote))
}

/// Resolve a remote URL into its backend plus (base_path, name).
pub fn remote_for_url(url: &str) -> Result<(Arc<dyn Remote>, RemoteUrl)> {
    let parsed = RemoteUrl::parse(url)?;
    let remote = create_remote(&parsed.scheme, &parsed.netloc, &parsed.init_args);
    Ok((remote, parsed))
}

/// Try each URL in order and return the first payload that downloads,
/// together with the extension of the stored blob name.
pub fn download_first_reachable(urls: &[String]) -> Result<(String, Vec<u8>)> {
    for url in urls {
        let (remote, parsed) = match remote_for_url(url) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::debug!("unparsable remote url '{url}': {err}");
                continue;
            }
        };
        let mut buffer = Vec::new();
        if remote.download_stream(&mut buffer, &parsed.base_path, &parsed.name, 0) {
            let extension = Path::new(&parsed.name)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            return Ok((extension, buffer));
        }
        tracing::debug!("unknown or unreachable remote: {url}");
    }
    Err(PipelimeError::RemoteUnreachable(urls.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parse_splits_base_and_name() {
        let parsed = RemoteUrl::parse("file://localhost/tmp/datalake/abc123.png").unwrap();
        assert_eq!(parsed.scheme, "file");
        assert_eq!(parsed.netloc, "localhost");
        assert_eq!(parsed.base_path, "tmp/datalake");
        assert_eq!(parsed.name, "abc123.png");
    }

    #[test]
    fn url_query_values_decode_to_native_types() {
        let parsed =
            RemoteUrl::parse("s3://host:9000/bucket/x.bin?secure=False:retries=3:ratio=0.5:tag=a")
                .unwrap();
        assert_eq!(parsed.init_args["secure"], serde_json::json!(false));
        assert_eq!(parsed.init_args["retries"], serde_json::json!(3));
        assert_eq!(parsed.init_args["ratio"], serde_json::json!(0.5));
        assert_eq!(parsed.init_args["tag"], serde_json::json!("a"));
    }

    #[test]
    fn hash_stream_rewinds_the_source() {
        let mut stream = std::io::Cursor::new(b"hello world".to_vec());
        let digest = hash_stream(&mut stream, HashAlgorithm::Sha256).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(stream.stream_position().unwrap(), 0);
    }

    #[test]
    fn unknown_scheme_yields_null_remote() {
        let remote = create_remote("gopher", "nowhere", &BTreeMap::new());
        assert!(!remote.is_valid());
        assert!(remote.hash_algorithm("bucket").is_none());
    }
}
