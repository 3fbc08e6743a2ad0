//! Minimal reader for NumPy `.npy` arrays (C order, `u1` and little-endian `f4`).

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;

use crate::error::VrError;

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, PartialEq)]
pub enum NpyData {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: NpyData,
}

impl NpyArray {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_u8(self) -> Result<(Vec<usize>, Vec<u8>), VrError> {
        match self.data {
            NpyData::U8(data) => Ok((self.shape, data)),
            NpyData::F32(_) => Err(VrError::Npy("expected uint8 data, found float32".into())),
        }
    }
}

pub fn read_npy(path: &Path) -> Result<NpyArray> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    parse_npy(&bytes).with_context(|| format!("Failed to parse {:?}", path))
}

pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray, VrError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(VrError::Npy("missing magic string".into()));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(VrError::Npy("truncated header".into()));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => return Err(VrError::Npy(format!("unsupported format version {}", v))),
    };
    let body_start = header_start + header_len;
    let header = bytes
        .get(header_start..body_start)
        .ok_or_else(|| VrError::Npy("truncated header".into()))?;
    let header = std::str::from_utf8(header).map_err(|e| VrError::Npy(e.to_string()))?;
    let (descr, shape) = parse_header(header)?;

    let body = &bytes[body_start..];
    let count: usize = shape.iter().product();
    let data = match descr.as_str() {
        "|u1" | "<u1" => {
            let data = body
                .get(..count)
                .ok_or_else(|| VrError::Npy(format!("expected {} bytes of data", count)))?;
            NpyData::U8(data.to_vec())
        }
        "<f4" => {
            let data = body
                .get(..count * 4)
                .ok_or_else(|| VrError::Npy(format!("expected {} bytes of data", count * 4)))?;
            NpyData::F32(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        other => return Err(VrError::Npy(format!("unsupported dtype '{}'", other))),
    };
    Ok(NpyArray { shape, data })
}

fn parse_header(header: &str) -> Result<(String, Vec<usize>), VrError> {
    let regex = |pattern: &str| Regex::new(pattern).map_err(|e| VrError::Npy(e.to_string()));
    let descr = regex(r"'descr':\s*'([^']+)'")?
        .captures(header)
        .map(|c| c[1].to_string())
        .ok_or_else(|| VrError::Npy("header has no descr".into()))?;
    let fortran = regex(r"'fortran_order':\s*(True|False)")?
        .captures(header)
        .map(|c| &c[1] == "True")
        .ok_or_else(|| VrError::Npy("header has no fortran_order".into()))?;
    if fortran {
        return Err(VrError::Npy("Fortran-ordered arrays are not supported".into()));
    }
    let dims = regex(r"'shape':\s*\(([^)]*)\)")?
        .captures(header)
        .map(|c| c[1].to_string())
        .ok_or_else(|| VrError::Npy("header has no shape".into()))?;
    let shape = dims
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<usize>()
                .map_err(|_| VrError::Npy(format!("bad dimension '{}'", d)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((descr, shape))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encodes a version 1.0 `.npy` file.
    pub(crate) fn encode_npy(descr: &str, shape: &[usize], body: &[u8]) -> Vec<u8> {
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        let dims = if dims.len() == 1 {
            format!("{},", dims[0])
        } else {
            dims.join(", ")
        };
        let mut header = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': ({}), }}",
            descr, dims
        );
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');

        let mut bytes = MAGIC.to_vec();
        bytes.extend([1u8, 0u8]);
        bytes.extend((header.len() as u16).to_le_bytes());
        bytes.extend(header.as_bytes());
        bytes.extend(body);
        bytes
    }

    #[test]
    fn test_parse_u8() {
        let body: Vec<u8> = (0..12).collect();
        let array = parse_npy(&encode_npy("|u1", &[2, 2, 3], &body)).unwrap();
        assert_eq!(array.shape, vec![2, 2, 3]);
        assert_eq!(array.len(), 12);
        assert_eq!(array.into_u8().unwrap().1, body);
    }

    #[test]
    fn test_parse_f32_vector() {
        let body: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let array = parse_npy(&encode_npy("<f4", &[2], &body)).unwrap();
        assert_eq!(array.shape, vec![2]);
        assert_eq!(array.data, NpyData::F32(vec![1.5, -2.0]));
        assert!(array.into_u8().is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_npy(b"not a numpy file").is_err());
        assert!(parse_npy(&encode_npy("<f8", &[1], &[0; 8])).is_err());
        // body shorter than the shape requires
        assert!(parse_npy(&encode_npy("|u1", &[4, 4], &[0; 3])).is_err());
    }
}
