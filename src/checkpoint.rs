//! Persisted model state: a gzip stream holding a bag of named 2-D tensors.
//!
//! Layout: `DBNT`, version (u32), tensor count (u32), then per tensor its name
//! (u16 length + UTF-8), rows and cols (u32) and the row-major `f64` data, all
//! little endian.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::info;
use ndarray::Array2;

use crate::error::{Error, Result};
use crate::network::Network;

const MAGIC: &[u8; 4] = b"DBNT";
const VERSION: u32 = 1;

pub fn save_tensors(path: &Path, tensors: &BTreeMap<String, Array2<f64>>) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut w = GzEncoder::new(file, Compression::fast());

    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(VERSION)?;
    w.write_u32::<LittleEndian>(len_u32(tensors.len())?)?;
    for (name, tensor) in tensors {
        let name_len = u16::try_from(name.len())
            .map_err(|_| Error::Checkpoint(format!("tensor name `{name}` is too long")))?;
        w.write_u16::<LittleEndian>(name_len)?;
        w.write_all(name.as_bytes())?;
        w.write_u32::<LittleEndian>(len_u32(tensor.nrows())?)?;
        w.write_u32::<LittleEndian>(len_u32(tensor.ncols())?)?;
        for &value in tensor.iter() {
            w.write_f64::<LittleEndian>(value)?;
        }
    }
    w.finish()?.flush()?;
    Ok(())
}

pub fn load_tensors(path: &Path) -> Result<BTreeMap<String, Array2<f64>>> {
    let mut r = GzDecoder::new(BufReader::new(File::open(path)?));

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Checkpoint(format!(
            "{} is not a tensor checkpoint",
            path.display()
        )));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::Checkpoint(format!("unsupported version {version}")));
    }

    let count = r.read_u32::<LittleEndian>()?;
    let mut tensors = BTreeMap::new();
    for _ in 0..count {
        let mut name = vec![0u8; r.read_u16::<LittleEndian>()? as usize];
        r.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::Checkpoint("tensor name is not UTF-8".to_string()))?;
        let rows = r.read_u32::<LittleEndian>()? as usize;
        let cols = r.read_u32::<LittleEndian>()? as usize;

        let data = read_values(&mut r, &name, rows, cols)?;
        let tensor = Array2::from_shape_vec((rows, cols), data)
            .map_err(|err| Error::Checkpoint(err.to_string()))?;
        if tensors.insert(name.clone(), tensor).is_some() {
            return Err(Error::Checkpoint(format!("tensor `{name}` appears twice")));
        }
    }
    Ok(tensors)
}

pub fn save_network(path: &Path, network: &Network) -> Result<()> {
    save_tensors(path, &network.to_named_tensors())?;
    info!("Saved {:?} network to {}", network.widths(), path.display());
    Ok(())
}

pub fn load_network(path: &Path) -> Result<Network> {
    let network = Network::from_named_tensors(load_tensors(path)?)?;
    info!("Loaded {:?} network from {}", network.widths(), path.display());
    Ok(network)
}

/// Reads `rows * cols` values without trusting the header for the allocation;
/// a stream that ends early is malformed.
fn read_values<R: Read>(r: &mut R, name: &str, rows: usize, cols: usize) -> Result<Vec<f64>> {
    let Some(num_bytes) = rows
        .checked_mul(cols)
        .and_then(|len| len.checked_mul(std::mem::size_of::<f64>()))
    else {
        return Err(Error::Checkpoint(format!(
            "tensor `{name}` declares an impossible shape {rows}x{cols}"
        )));
    };

    let mut bytes = Vec::new();
    r.take(num_bytes as u64).read_to_end(&mut bytes)?;
    if bytes.len() != num_bytes {
        return Err(Error::Checkpoint(format!(
            "tensor `{name}` is truncated: {} of {num_bytes} bytes",
            bytes.len()
        )));
    }
    let mut data = vec![0.0; rows * cols];
    LittleEndian::read_f64_into(&bytes, &mut data);
    Ok(data)
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Checkpoint(format!("dimension {len} does not fit in u32")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    #[test]
    fn network_round_trips_bit_for_bit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.dbn");
        let network = Network::random(&[12, 8, 6, 3], &mut StdRng::seed_from_u64(13));

        save_network(&path, &network).unwrap();
        let loaded = load_network(&path).unwrap();

        assert_eq!(loaded, network);
        for (name, tensor) in load_tensors(&path).unwrap() {
            let original = &network.to_named_tensors()[&name];
            let same_bits = tensor
                .iter()
                .zip(original.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same_bits, "{name} changed");
        }
    }

    #[test]
    fn reference_stack_has_twelve_tensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.dbn");
        let network = Network::random(&[784, 500, 500, 2000, 10], &mut StdRng::seed_from_u64(0));
        save_network(&path, &network).unwrap();

        let tensors = load_tensors(&path).unwrap();
        assert_eq!(tensors.len(), 12);
        assert_eq!(tensors["W_0"].dim(), (784, 500));
        assert_eq!(tensors["W_3"].dim(), (2000, 10));
        assert_eq!(tensors["hB_2"].dim(), (1, 2000));
        assert_eq!(tensors["vB_0"].dim(), (1, 784));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-a-model");
        let mut w = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        w.write_all(b"NOPE0000").unwrap();
        w.finish().unwrap();
        assert!(matches!(load_tensors(&path), Err(Error::Checkpoint(_))));
    }

    fn write_header(path: &Path, name: &str, rows: u32, cols: u32, values: &[f64]) {
        let mut w = GzEncoder::new(File::create(path).unwrap(), Compression::fast());
        w.write_all(MAGIC).unwrap();
        w.write_u32::<LittleEndian>(VERSION).unwrap();
        w.write_u32::<LittleEndian>(1).unwrap();
        w.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        w.write_all(name.as_bytes()).unwrap();
        w.write_u32::<LittleEndian>(rows).unwrap();
        w.write_u32::<LittleEndian>(cols).unwrap();
        for &value in values {
            w.write_f64::<LittleEndian>(value).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn oversized_tensor_header_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.dbn");

        write_header(&path, "W_0", u32::MAX, u32::MAX, &[1.0]);
        assert!(matches!(load_tensors(&path), Err(Error::Checkpoint(_))));

        // fits in usize but far exceeds the data actually present
        write_header(&path, "W_0", 1 << 20, 1 << 20, &[1.0, 2.0]);
        let err = load_tensors(&path).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn missing_layer_tensor_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.dbn");
        let network = Network::random(&[4, 3, 2], &mut StdRng::seed_from_u64(2));
        let mut tensors = network.to_named_tensors();
        tensors.remove("hB_0");
        save_tensors(&path, &tensors).unwrap();
        assert!(matches!(load_network(&path), Err(Error::MissingTensor(_))));
    }
}
