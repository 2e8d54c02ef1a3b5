//! Extension-driven payload codecs.
//!
//! Maps file extensions to encode/decode pairs for every item category:
//! images, numpy-native and numpy-text arrays, markup metadata, opaque
//! binary objects, raw bytes and remote placeholders. Decoding is
//! extension-first with image content sniffing as the final fallback, so an
//! ambiguous or mislabeled raster file still loads. Decoding a
//! remote-category payload parses the URL list and recursively decodes the
//! first reachable remote source by its own extension.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use ndarray::ArrayD;

use crate::error::{PipelimeError, Result};
use crate::remote;
use crate::value::{json_to_toml, toml_to_json, ItemValue};

pub mod npy;

pub const IMAGE_EXT: &[&str] = &["jpg", "jpeg", "png", "tiff", "bmp"];
pub const NUMPY_NATIVE_EXT: &[&str] = &["npy", "npz"];
pub const NUMPY_TXT_EXT: &[&str] = &["txt", "data"];
pub const YAML_EXT: &[&str] = &["yml", "yaml"];
pub const JSON_EXT: &[&str] = &["json"];
pub const TOML_EXT: &[&str] = &["toml", "tml"];
pub const PICKLE_EXT: &[&str] = &["pkl", "pickle"];
pub const BINARY_EXT: &[&str] = &["bin"];
pub const REMOTE_EXT: &[&str] = &["remote", "rmt", "plr"];

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXT.contains(&ext)
}

pub fn is_metadata_extension(ext: &str) -> bool {
    YAML_EXT.contains(&ext) || JSON_EXT.contains(&ext) || TOML_EXT.contains(&ext)
}

pub fn is_remote_extension(ext: &str) -> bool {
    REMOTE_EXT.contains(&ext)
}

/// Lowercased extension without the leading dot; empty when absent.
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn image_format_for(ext: &str) -> Result<image::ImageFormat> {
    image::ImageFormat::from_extension(ext)
        .ok_or_else(|| PipelimeError::UnsupportedCodec(ext.to_string()))
}

fn decode_txt_array(bytes: &[u8]) -> Result<ArrayD<f64>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PipelimeError::Serialization(format!("text array is not utf-8: {e}")))?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|e| {
                    PipelimeError::Serialization(format!(
                        "bad numeric token '{tok}' on line {}: {e}",
                        lineno + 1
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    let cols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != cols) {
        return Err(PipelimeError::Serialization(
            "text array rows have inconsistent lengths".to_string(),
        ));
    }
    let data: Vec<f64> = rows.into_iter().flatten().collect();
    // Text arrays are at-least-2-D: a single row still decodes to (1, n).
    let shape = vec![data.len() / cols.max(1), cols];
    Ok(ArrayD::from_shape_vec(shape, data)?)
}

fn encode_txt_array(array: &ArrayD<f64>) -> Result<Vec<u8>> {
    let mut out = String::new();
    match array.ndim() {
        1 => {
            for v in array.iter() {
                out.push_str(&format!("{v:.18e}\n"));
            }
        }
        2 => {
            let rows = array.shape()[0];
            let cols = array.shape()[1];
            for r in 0..rows {
                let row: Vec<String> = (0..cols)
                    .map(|c| format!("{:.18e}", array[[r, c]]))
                    .collect();
                out.push_str(&row.join(" "));
                out.push('\n');
            }
        }
        n => {
            return Err(PipelimeError::Serialization(format!(
                "cannot encode a {n}-D array as text"
            )))
        }
    }
    Ok(out.into_bytes())
}

/// Parse a `.remote` manifest: one URL per line, trailing whitespace
/// trimmed, blank lines ignored.
pub fn parse_remote_manifest(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PipelimeError::Serialization(format!("remote manifest is not utf-8: {e}")))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Decode a byte payload according to its extension.
pub fn decode_bytes(bytes: &[u8], extension: &str) -> Result<ItemValue> {
    if YAML_EXT.contains(&extension) {
        return Ok(ItemValue::Metadata(serde_yaml::from_slice(bytes)?));
    }
    if JSON_EXT.contains(&extension) {
        return Ok(ItemValue::Metadata(serde_json::from_slice(bytes)?));
    }
    if TOML_EXT.contains(&extension) {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PipelimeError::Serialization(format!("toml is not utf-8: {e}")))?;
        return Ok(ItemValue::Metadata(toml_to_json(text.parse::<toml::Value>()?)));
    }
    if PICKLE_EXT.contains(&extension) {
        return ItemValue::from_opaque_bytes(bytes);
    }
    if BINARY_EXT.contains(&extension) {
        return Ok(ItemValue::Bytes(bytes.to_vec()));
    }
    if NUMPY_TXT_EXT.contains(&extension) {
        return Ok(ItemValue::Array(decode_txt_array(bytes)?));
    }
    if extension == "npy" {
        return Ok(ItemValue::Array(npy::decode(bytes)?));
    }
    if extension == "npz" {
        return Ok(ItemValue::Array(npy::decode_npz(bytes)?));
    }
    if REMOTE_EXT.contains(&extension) {
        let urls = parse_remote_manifest(bytes)?;
        let (remote_ext, payload) = remote::download_first_reachable(&urls)?;
        return decode_bytes(&payload, &remote_ext);
    }
    // Images last: detected by content, not only by suffix, so ambiguous
    // extensions still decode.
    if image::guess_format(bytes).is_ok() {
        return Ok(ItemValue::Image(image::load_from_memory(bytes)?));
    }
    Err(PipelimeError::UnsupportedCodec(extension.to_string()))
}

/// Encode a value into the byte representation of the given extension.
pub fn encode_bytes(value: &ItemValue, extension: &str) -> Result<Vec<u8>> {
    if is_image_extension(extension) {
        let image = value.as_image().ok_or_else(|| {
            PipelimeError::Serialization(format!(
                "cannot encode a {} value as an image",
                value.kind()
            ))
        })?;
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, image_format_for(extension)?)?;
        return Ok(buf.into_inner());
    }
    if NUMPY_TXT_EXT.contains(&extension) {
        let array = expect_array(value)?;
        return encode_txt_array(array);
    }
    if extension == "npy" {
        let array = expect_array(value)?;
        let mut buf = Vec::new();
        npy::encode(&mut buf, array)?;
        return Ok(buf);
    }
    if extension == "npz" {
        let array = expect_array(value)?;
        let mut buf = Cursor::new(Vec::new());
        npy::encode_npz(&mut buf, array)?;
        return Ok(buf.into_inner());
    }
    if YAML_EXT.contains(&extension) {
        let meta = expect_metadata(value)?;
        return Ok(serde_yaml::to_string(meta)?.into_bytes());
    }
    if JSON_EXT.contains(&extension) {
        let meta = expect_metadata(value)?;
        return Ok(serde_json::to_vec(meta)?);
    }
    if TOML_EXT.contains(&extension) {
        let meta = expect_metadata(value)?;
        return Ok(toml::to_string(&json_to_toml(meta)?)?.into_bytes());
    }
    if PICKLE_EXT.contains(&extension) {
        return value.to_opaque_bytes();
    }
    if BINARY_EXT.contains(&extension) {
        return match value {
            ItemValue::Bytes(b) => Ok(b.clone()),
            other => Err(PipelimeError::Serialization(format!(
                "cannot encode a {} value as raw bytes",
                other.kind()
            ))),
        };
    }
    if REMOTE_EXT.contains(&extension) {
        return match value {
            ItemValue::RemoteList(urls) => Ok((urls.join("\n") + "\n").into_bytes()),
            other => Err(PipelimeError::Serialization(format!(
                "cannot encode a {} value as a remote manifest",
                other.kind()
            ))),
        };
    }
    Err(PipelimeError::UnsupportedCodec(extension.to_string()))
}

fn expect_array(value: &ItemValue) -> Result<&ArrayD<f64>> {
    value.as_array().ok_or_else(|| {
        PipelimeError::Serialization(format!(
            "cannot encode a {} value as a numeric array",
            value.kind()
        ))
    })
}

fn expect_metadata(value: &ItemValue) -> Result<&serde_json::Value> {
    value.as_metadata().ok_or_else(|| {
        PipelimeError::Serialization(format!(
            "cannot encode a {} value as metadata",
            value.kind()
        ))
    })
}

/// Load and decode a file by its extension. `.remote` manifests resolve to
/// the referenced payload.
pub fn load_item(path: &Path) -> Result<ItemValue> {
    let extension = file_extension(path);
    let bytes = fs::read(path)?;
    decode_bytes(&bytes, &extension).map_err(|err| match err {
        PipelimeError::Codec { .. } => err,
        other => PipelimeError::codec(
            path.display().to_string(),
            extension.clone(),
            other.to_string(),
        ),
    })
}

/// Encode and store a value into a file named with a known extension.
pub fn store_item(path: &Path, value: &ItemValue) -> Result<()> {
    let extension = file_extension(path);
    let bytes = encode_bytes(value, &extension)?;
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_roundtrips_through_every_markup_codec() {
        let value = ItemValue::Metadata(json!({"label": 5, "name": "s", "tags": ["a", "b"]}));
        for ext in ["json", "yml", "yaml", "toml", "tml"] {
            let bytes = encode_bytes(&value, ext).unwrap();
            assert_eq!(decode_bytes(&bytes, ext).unwrap(), value, "ext {ext}");
        }
    }

    #[test]
    fn text_array_is_at_least_two_dimensional() {
        let decoded = decode_bytes(b"1 2 3\n", "txt").unwrap();
        let array = decoded.as_array().unwrap();
        assert_eq!(array.shape(), &[1, 3]);
    }

    #[test]
    fn image_decodes_by_content_under_wrong_extension() {
        let image = image::DynamicImage::new_rgb8(4, 4);
        let bytes = encode_bytes(&ItemValue::Image(image.clone()), "png").unwrap();
        // Unknown extension, valid png content: sniffing wins.
        let decoded = decode_bytes(&bytes, "weird").unwrap();
        assert_eq!(decoded, ItemValue::Image(image));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = decode_bytes(b"not an image", "weird").unwrap_err();
        assert!(matches!(err, PipelimeError::UnsupportedCodec(_)));
    }

    #[test]
    fn remote_manifest_parsing_skips_blank_lines() {
        let urls =
            parse_remote_manifest(b"file://localhost/a/b.png  \n\n file://localhost/c/d.png\n")
                .unwrap();
        assert_eq!(
            urls,
            vec![
                "file://localhost/a/b.png".to_string(),
                "file://localhost/c/d.png".to_string()
            ]
        );
    }
}
