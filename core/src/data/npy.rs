//! Minimal reader and writer for NumPy `.npy` files of unsigned bytes.
//!
//! Layout: the magic `\x93NUMPY`, a major/minor version, a little-endian header length (`u16`
//! for version 1, `u32` for versions 2 and 3), then an ASCII dict such as
//! `{'descr': '|u1', 'fortran_order': False, 'shape': (20, 10000, 64, 64), }`, then raw data.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// A C-ordered `u8` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

/// Reads a `|u1` (or `<u1`) C-ordered array from `path`.
pub fn read_u8<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let mut reader = BufReader::new(File::open(path)?);
    read_u8_from(&mut reader)
}

pub fn read_u8_from(reader: &mut dyn Read) -> Result<NpyArray> {
    let mut magic = [0_u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Dataset("not a .npy file (bad magic)".into()));
    }

    let mut version = [0_u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => {
            let mut bytes = [0_u8; 2];
            reader.read_exact(&mut bytes)?;
            u16::from_le_bytes(bytes) as usize
        }
        2 | 3 => {
            let mut bytes = [0_u8; 4];
            reader.read_exact(&mut bytes)?;
            u32::from_le_bytes(bytes) as usize
        }
        major => {
            return Err(Error::Dataset(format!(
                "unsupported .npy version {}.{}",
                major, version[1]
            )));
        }
    };

    let mut header = vec![0_u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);
    let shape = parse_header(&header)?;

    let size: usize = shape.iter().product();
    let mut data = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut data)?;
    if data.len() != size {
        return Err(Error::Dataset(format!(
            "truncated .npy data: expected {} bytes, found {}",
            size,
            data.len()
        )));
    }

    Ok(NpyArray { shape, data })
}

/// Validates the header dict and returns the shape.
fn parse_header(header: &str) -> Result<Vec<usize>> {
    let descr = dict_value(header, "descr")
        .ok_or_else(|| Error::Dataset("missing 'descr' in .npy header".into()))?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    if descr != "|u1" && descr != "<u1" && descr != "u1" {
        return Err(Error::Dataset(format!(
            "expected an unsigned byte array, got dtype '{descr}'"
        )));
    }

    let fortran = dict_value(header, "fortran_order")
        .ok_or_else(|| Error::Dataset("missing 'fortran_order' in .npy header".into()))?;
    if fortran.starts_with("True") {
        return Err(Error::Dataset("Fortran-ordered arrays are not supported".into()));
    }

    let key = header
        .find("'shape'")
        .ok_or_else(|| Error::Dataset("missing 'shape' in .npy header".into()))?;
    let rest = &header[key..];
    let open = rest
        .find('(')
        .ok_or_else(|| Error::Dataset("malformed shape in .npy header".into()))?;
    let close = rest
        .find(')')
        .ok_or_else(|| Error::Dataset("malformed shape in .npy header".into()))?;

    rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| Error::Dataset(format!("bad dimension '{dim}' in .npy header")))
        })
        .collect()
}

/// Raw text after `'key':`, up to the next comma outside parentheses.
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = header.find(&format!("'{key}'"))? + key.len() + 2;
    let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();
    let end = rest.find([',', '}']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Writes a version 1.0 `|u1` array.
pub fn write_u8<P: AsRef<Path>>(path: P, shape: &[usize], data: &[u8]) -> Result<()> {
    let size: usize = shape.iter().product();
    if size != data.len() {
        return Err(Error::Dataset(format!(
            "shape {:?} needs {} bytes, got {}",
            shape,
            size,
            data.len()
        )));
    }

    let dims = match shape {
        [single] => format!("{single},"),
        _ => shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    };
    let mut header = format!("{{'descr': '|u1', 'fortran_order': False, 'shape': ({dims}), }}");
    // Pad so the data starts on a 64-byte boundary, newline-terminated
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| Error::Dataset("npy header too long".into()))?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(version: u8, header: &str, data: &[u8]) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[version, 0]);
        if version == 1 {
            bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        } else {
            bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        }
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn test_parse_v1() {
        let bytes = encode(
            1,
            "{'descr': '|u1', 'fortran_order': False, 'shape': (2, 3), }\n",
            &[1, 2, 3, 4, 5, 6],
        );
        let array = read_u8_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(array.shape, vec![2, 3]);
        assert_eq!(array.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_parse_v2_one_dim() {
        let bytes = encode(
            2,
            "{'descr': '|u1', 'fortran_order': False, 'shape': (4,), }\n",
            &[9, 8, 7, 6],
        );
        let array = read_u8_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(array.shape, vec![4]);
    }

    #[test]
    fn test_rejects_other_dtypes_and_layouts() {
        let float = encode(1, "{'descr': '<f4', 'fortran_order': False, 'shape': (1,), }", &[0; 4]);
        assert!(read_u8_from(&mut float.as_slice()).is_err());

        let fortran = encode(1, "{'descr': '|u1', 'fortran_order': True, 'shape': (1,), }", &[0]);
        assert!(read_u8_from(&mut fortran.as_slice()).is_err());

        let truncated = encode(1, "{'descr': '|u1', 'fortran_order': False, 'shape': (3,), }", &[0]);
        assert!(read_u8_from(&mut truncated.as_slice()).is_err());

        assert!(read_u8_from(&mut &b"PK\x03\x04 not numpy"[..]).is_err());
    }

    #[test]
    fn test_write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.npy");
        let data: Vec<u8> = (0..24).collect();
        write_u8(&path, &[2, 3, 4], &data).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // Header is padded so data is 64-byte aligned
        assert_eq!((bytes.len() - data.len()) % 64, 0);

        let array = read_u8(&path).unwrap();
        assert_eq!(array.shape, vec![2, 3, 4]);
        assert_eq!(array.data, data);
    }
}
