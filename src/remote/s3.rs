//! S3-compatible remote backend (`s3://` scheme).
//!
//! Buckets are named by the URL base path; the endpoint is the netloc.
//! Backend init options come from the URL query (`access_key`, `secret_key`,
//! `session_token`, `secure_connection`, `region`). The per-bucket hash
//! algorithm rides in a bucket-root metadata object `.pl/tags.json` carrying
//! the same `__HASH_FN__` entry as the file backend: the S3 client exposes
//! no bucket-level tagging, so the tag travels as object content instead.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};

use super::{HashAlgorithm, ReadSeek, Remote, DEFAULT_HASH_FN, HASH_FN_KEY};

const TAGS_OBJECT: &str = ".pl/tags.json";

pub struct S3Remote {
    netloc: String,
    region: Region,
    credentials: Option<Credentials>,
}

fn arg_str(args: &BTreeMap<String, serde_json::Value>, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

impl S3Remote {
    pub fn new(netloc: &str, init_args: &BTreeMap<String, serde_json::Value>) -> S3Remote {
        let secure = init_args
            .get("secure_connection")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let endpoint = if secure {
            format!("https://{netloc}")
        } else {
            format!("http://{netloc}")
        };
        let region = Region::Custom {
            region: arg_str(init_args, "region").unwrap_or_default(),
            endpoint,
        };
        let credentials = Credentials::new(
            arg_str(init_args, "access_key").as_deref(),
            arg_str(init_args, "secret_key").as_deref(),
            None,
            arg_str(init_args, "session_token").as_deref(),
            None,
        )
        .map_err(|err| {
            tracing::error!("S3 remote '{netloc}' has no usable credentials: {err}");
            err
        })
        .ok();
        S3Remote {
            netloc: netloc.to_string(),
            region,
            credentials,
        }
    }

    fn bucket(&self, name: &str) -> Option<Box<Bucket>> {
        let credentials = self.credentials.clone()?;
        match Bucket::new(name, self.region.clone(), credentials) {
            Ok(bucket) => Some(Box::new(bucket.with_path_style())),
            Err(err) => {
                tracing::warn!("cannot address bucket '{name}': {err}");
                None
            }
        }
    }

    fn ensure_bucket(&self, name: &str) -> Option<Box<Bucket>> {
        let bucket = self.bucket(name)?;
        match bucket.exists_blocking() {
            Ok(true) => Some(bucket),
            Ok(false) => {
                tracing::info!("Creating bucket {name} on S3 remote {}.", self.netloc);
                let credentials = self.credentials.clone()?;
                match Bucket::create_with_path_style_blocking(
                    name,
                    self.region.clone(),
                    credentials,
                    BucketConfiguration::default(),
                ) {
                    Ok(_) => Some(bucket),
                    Err(err) => {
                        tracing::warn!("cannot create bucket '{name}': {err}");
                        None
                    }
                }
            }
            Err(err) => {
                tracing::warn!("cannot probe bucket '{name}': {err}");
                None
            }
        }
    }

    fn read_tags(&self, bucket: &Bucket) -> BTreeMap<String, String> {
        bucket
            .get_object_blocking(TAGS_OBJECT)
            .ok()
            .filter(|response| response.status_code() == 200)
            .and_then(|response| serde_json::from_slice(response.bytes()).ok())
            .unwrap_or_default()
    }

    fn write_tags(&self, bucket: &Bucket, tags: &BTreeMap<String, String>) -> bool {
        let payload = serde_json::to_vec(tags).expect("string map serializes");
        match bucket.put_object_blocking(TAGS_OBJECT, &payload) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("cannot persist bucket tags: {err}");
                false
            }
        }
    }
}

impl Remote for S3Remote {
    fn scheme(&self) -> &'static str {
        "s3"
    }

    fn netloc(&self) -> &str {
        &self.netloc
    }

    fn is_valid(&self) -> bool {
        self.credentials.is_some()
    }

    fn hash_algorithm(&self, base_path: &str) -> Option<HashAlgorithm> {
        let bucket = self.ensure_bucket(base_path)?;
        let tags = self.read_tags(&bucket);
        if let Some(algorithm) = tags.get(HASH_FN_KEY).and_then(|n| HashAlgorithm::parse(n)) {
            return Some(algorithm);
        }
        let mut tags = tags;
        tags.insert(HASH_FN_KEY.to_string(), DEFAULT_HASH_FN.to_string());
        if !self.write_tags(&bucket, &tags) {
            return None;
        }
        // Re-read after write: a racing first-uploader may have won.
        let tags = self.read_tags(&bucket);
        tags.get(HASH_FN_KEY)
            .and_then(|n| HashAlgorithm::parse(n))
            .or(Some(HashAlgorithm::Sha256))
    }

    fn put(&self, payload: &mut dyn ReadSeek, size: u64, base_path: &str, name: &str) -> bool {
        let Some(bucket) = self.ensure_bucket(base_path) else {
            return false;
        };
        let mut buffer = Vec::with_capacity(size as usize);
        if let Err(err) = payload.read_to_end(&mut buffer) {
            tracing::warn!("cannot buffer upload payload: {err}");
            return false;
        }
        match bucket.put_object_blocking(name, &buffer) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("upload of '{name}' to bucket '{base_path}' failed: {err}");
                false
            }
        }
    }

    fn get(&self, sink: &mut dyn Write, base_path: &str, name: &str, offset: u64) -> bool {
        let Some(bucket) = self.bucket(base_path) else {
            return false;
        };
        match bucket.exists_blocking() {
            Ok(true) => {}
            _ => {
                tracing::warn!(
                    "Bucket {base_path} does not exist on S3 remote {}.",
                    self.netloc
                );
                return false;
            }
        }
        let response = if offset > 0 {
            bucket.get_object_range_blocking(name, offset, None)
        } else {
            bucket.get_object_blocking(name)
        };
        match response {
            Ok(response) if response.status_code() < 300 => {
                if let Err(err) = sink.write_all(response.bytes()) {
                    tracing::warn!("cannot write downloaded payload: {err}");
                    return false;
                }
                true
            }
            Ok(response) => {
                tracing::warn!(
                    "download of '{name}' from bucket '{base_path}' failed with status {}",
                    response.status_code()
                );
                false
            }
            Err(err) => {
                tracing::warn!("download of '{name}' from bucket '{base_path}' failed: {err}");
                false
            }
        }
    }
}
