//! NumPy native array codec (`npy` v1 files plus single-entry `npz`
//! archives).
//!
//! Only the subset of the format the datasets actually use is implemented:
//! little-endian numeric dtypes, boolean arrays, C or Fortran order. Arrays
//! always decode to `f64` elements; encoding always emits `<f8` C-order
//! payloads, so a decode/encode pass normalizes the dtype without touching
//! the values.

use std::io::{Cursor, Read, Write};

use ndarray::{ArrayD, ShapeBuilder};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PipelimeError, Result};

const MAGIC: &[u8] = b"\x93NUMPY";

static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"'descr':\s*'([^']+)'.*'fortran_order':\s*(True|False).*'shape':\s*\(([^)]*)\)",
    )
    .expect("npy header regex is valid")
});

fn serialization_err(reason: impl Into<String>) -> PipelimeError {
    PipelimeError::Serialization(format!("npy: {}", reason.into()))
}

/// Element width and reader for a supported dtype descriptor.
fn dtype_reader(descr: &str) -> Result<(usize, fn(&[u8]) -> f64)> {
    // Leading byte-order mark: '<' little endian, '|' not applicable.
    let (order, code) = descr.split_at(1);
    if order != "<" && order != "|" {
        return Err(serialization_err(format!(
            "unsupported byte order in dtype '{descr}'"
        )));
    }
    let reader: (usize, fn(&[u8]) -> f64) = match code {
        "f8" => (8, |b| f64::from_le_bytes(b.try_into().unwrap())),
        "f4" => (4, |b| f32::from_le_bytes(b.try_into().unwrap()) as f64),
        "i8" => (8, |b| i64::from_le_bytes(b.try_into().unwrap()) as f64),
        "i4" => (4, |b| i32::from_le_bytes(b.try_into().unwrap()) as f64),
        "i2" => (2, |b| i16::from_le_bytes(b.try_into().unwrap()) as f64),
        "i1" => (1, |b| b[0] as i8 as f64),
        "u8" => (8, |b| u64::from_le_bytes(b.try_into().unwrap()) as f64),
        "u4" => (4, |b| u32::from_le_bytes(b.try_into().unwrap()) as f64),
        "u2" => (2, |b| u16::from_le_bytes(b.try_into().unwrap()) as f64),
        "u1" => (1, |b| b[0] as f64),
        "b1" => (1, |b| (b[0] != 0) as u8 as f64),
        _ => {
            return Err(serialization_err(format!(
                "unsupported dtype '{descr}'"
            )))
        }
    };
    Ok(reader)
}

pub fn decode(bytes: &[u8]) -> Result<ArrayD<f64>> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(serialization_err("missing magic string"));
    }
    let major = bytes[6];
    let header_len;
    let header_start;
    match major {
        1 => {
            header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            header_start = 10;
        }
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(serialization_err("truncated header"));
            }
            header_len =
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            header_start = 12;
        }
        other => {
            return Err(serialization_err(format!(
                "unsupported format version {other}"
            )))
        }
    }
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(serialization_err("truncated header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|e| serialization_err(format!("header is not utf-8: {e}")))?;

    let caps = HEADER_RE
        .captures(header)
        .ok_or_else(|| serialization_err(format!("malformed header '{}'", header.trim())))?;
    let descr = caps.get(1).unwrap().as_str();
    let fortran = caps.get(2).unwrap().as_str() == "True";
    let shape: Vec<usize> = caps
        .get(3)
        .unwrap()
        .as_str()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| serialization_err(format!("bad shape entry '{s}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let (width, read_elem) = dtype_reader(descr)?;
    let count: usize = shape.iter().product();
    let data = &bytes[data_start..];
    if data.len() < count * width {
        return Err(serialization_err(format!(
            "expected {} data bytes, found {}",
            count * width,
            data.len()
        )));
    }
    let values: Vec<f64> = data[..count * width]
        .chunks_exact(width)
        .map(read_elem)
        .collect();

    let array = if fortran {
        ArrayD::from_shape_vec(shape.f(), values)?
    } else {
        ArrayD::from_shape_vec(shape, values)?
    };
    Ok(array)
}

pub fn encode<W: Write>(sink: &mut W, array: &ArrayD<f64>) -> Result<()> {
    let shape = array
        .shape()
        .iter()
        .map(|d| format!("{d},"))
        .collect::<String>();
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}), }}",
        shape.trim_end_matches(',').replace(',', ", ")
            + if array.ndim() == 1 { "," } else { "" },
    );
    // Header (incl. magic and length field) is padded to 64-byte alignment
    // and newline-terminated.
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    sink.write_all(MAGIC)?;
    sink.write_all(&[1, 0])?;
    sink.write_all(&(header.len() as u16).to_le_bytes())?;
    sink.write_all(header.as_bytes())?;
    for value in array.iter() {
        sink.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Decode the first array stored in an `npz` archive.
pub fn decode_npz(bytes: &[u8]) -> Result<ArrayD<f64>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    if archive.is_empty() {
        return Err(serialization_err("empty npz archive"));
    }
    let mut entry = archive.by_index(0)?;
    let mut payload = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut payload)?;
    decode(&payload)
}

pub fn encode_npz<W: Write + std::io::Seek>(sink: &mut W, array: &ArrayD<f64>) -> Result<()> {
    let mut archive = zip::ZipWriter::new(sink);
    archive.start_file("arr_0.npy", zip::write::SimpleFileOptions::default())?;
    encode(&mut archive, array)?;
    archive.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn roundtrip_c_order() {
        let array =
            ArrayD::from_shape_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut buf = Vec::new();
        encode(&mut buf, &array).unwrap();
        assert_eq!(decode(&buf).unwrap(), array);
    }

    #[test]
    fn roundtrip_one_dimensional() {
        let array = ArrayD::from_shape_vec(vec![4], vec![0.5, 1.5, 2.5, 3.5]).unwrap();
        let mut buf = Vec::new();
        encode(&mut buf, &array).unwrap();
        assert_eq!(decode(&buf).unwrap(), array);
    }

    #[test]
    fn decodes_integer_dtypes() {
        // Hand-built <i4 payload, shape (2,).
        let header = "{'descr': '<i4', 'fortran_order': False, 'shape': (2,), }";
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[1, 0]);
        let mut header = header.to_string();
        header.push('\n');
        buf.extend_from_slice(&(header.len() as u16).to_le_bytes());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&7i32.to_le_bytes());
        buf.extend_from_slice(&(-3i32).to_le_bytes());
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.as_slice().unwrap(), &[7.0, -3.0]);
    }

    #[test]
    fn npz_roundtrip() {
        let array = ArrayD::from_shape_vec(vec![2, 2], vec![9.0, 8.0, 7.0, 6.0]).unwrap();
        let mut buf = Cursor::new(Vec::new());
        encode_npz(&mut buf, &array).unwrap();
        assert_eq!(decode_npz(buf.get_ref()).unwrap(), array);
    }
}
