//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use pipelime::underfolder::ReaderTemplate;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times — subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A small deterministic RGB test image; pixels depend on `seed` so two
/// seeds give different byte content.
#[allow(dead_code)]
pub fn toy_image(seed: u8) -> image::DynamicImage {
    image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(8, 6, |x, y| {
        image::Rgb([seed, (x * 31) as u8, (y * 17) as u8])
    }))
}

/// Build a toy underfolder with `count` samples and keys
/// `{image.png, metadata.yml, label.txt}` plus a shared root file
/// `classes.yml`. Returns the folder path.
#[allow(dead_code)]
pub fn toy_underfolder(folder: &Path, count: usize) -> PathBuf {
    let data = folder.join("data");
    std::fs::create_dir_all(&data).unwrap();
    let zfill = (count.max(2) - 1).to_string().len();
    for idx in 0..count {
        let stem = format!("{idx:0zfill$}");
        let image = toy_image(idx as u8);
        image
            .save_with_format(data.join(format!("{stem}_image.png")), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(
            data.join(format!("{stem}_metadata.yml")),
            format!("label: {}\nnum: {idx}\nparity: {}\n", idx % 10, idx % 2),
        )
        .unwrap();
        std::fs::write(
            data.join(format!("{stem}_label.txt")),
            format!("{idx} {}\n", idx * 2),
        )
        .unwrap();
    }
    std::fs::write(folder.join("classes.yml"), "- cat\n- dog\n").unwrap();
    folder.to_path_buf()
}

/// The template matching [`toy_underfolder`].
#[allow(dead_code)]
pub fn toy_template(count: usize) -> ReaderTemplate {
    ReaderTemplate::new(
        BTreeMap::from([
            ("image".to_string(), "png".to_string()),
            ("metadata".to_string(), "yml".to_string()),
            ("label".to_string(), "txt".to_string()),
            ("classes".to_string(), "yml".to_string()),
        ]),
        BTreeSet::from(["classes".to_string()]),
        (count.max(2) - 1).to_string().len(),
    )
}

/// Build a single-key underfolder: every sample holds `<key>.yml` with a
/// distinct value, plus optional extra flat yaml items.
#[allow(dead_code)]
pub fn single_key_underfolder(
    folder: &Path,
    count: usize,
    key: &str,
    extra: &[(&str, &str)],
) -> PathBuf {
    let data = folder.join("data");
    std::fs::create_dir_all(&data).unwrap();
    for idx in 0..count {
        std::fs::write(
            data.join(format!("{idx}_{key}.yml")),
            format!("value: {key}-{idx}\n"),
        )
        .unwrap();
        for (extra_key, content) in extra {
            std::fs::write(
                data.join(format!("{idx}_{extra_key}.yml")),
                format!("{content}\n"),
            )
            .unwrap();
        }
    }
    folder.to_path_buf()
}
