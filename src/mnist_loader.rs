use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use flate2::read::GzDecoder;
use log::info;
use ndarray::Array2;
use std::{
    fs::File,
    io::{BufReader, Cursor, Read},
    path::Path,
};

use crate::dataset::Dataset;
use crate::error::{Error, Result};

const IMAGES_MAGIC: i32 = 2051;
const LABELS_MAGIC: i32 = 2049;
pub const NUM_CLASSES: usize = 10;

#[derive(Debug)]
struct IdxRawData {
    sizes: Vec<usize>,
    data: Vec<u8>,
}

impl IdxRawData {
    /// Reads an IDX file, gunzipping it first when the path ends in `.gz`.
    fn new(path: &Path, expected_magic: i32) -> Result<IdxRawData> {
        let file = BufReader::new(File::open(path)?);
        let mut contents: Vec<u8> = Vec::new();
        if path.extension().is_some_and(|ext| ext == "gz") {
            GzDecoder::new(file).read_to_end(&mut contents)?;
        } else {
            let mut file = file;
            file.read_to_end(&mut contents)?;
        }
        let mut r = Cursor::new(&contents);

        let magic_number = r
            .read_i32::<BigEndian>()
            .map_err(|_| Error::dataset(path, "file too short for a header"))?;
        if magic_number != expected_magic {
            return Err(Error::dataset(
                path,
                format!("wrong magic number {magic_number}, expected {expected_magic}"),
            ));
        }

        let num_dims = match magic_number {
            LABELS_MAGIC => 1,
            _ => 3,
        };
        let mut sizes: Vec<usize> = Vec::with_capacity(num_dims);
        for _ in 0..num_dims {
            let size = r
                .read_i32::<BigEndian>()
                .map_err(|_| Error::dataset(path, "file too short for a header"))?;
            let size = usize::try_from(size)
                .map_err(|_| Error::dataset(path, format!("negative dimension {size}")))?;
            sizes.push(size);
        }

        let mut data: Vec<u8> = Vec::new();
        r.read_to_end(&mut data)?;

        let declared = sizes
            .iter()
            .try_fold(1usize, |acc, &size| acc.checked_mul(size))
            .ok_or_else(|| Error::dataset(path, format!("declared sizes {sizes:?} overflow")))?;
        if declared != data.len() {
            return Err(Error::dataset(
                path,
                format!(
                    "header declares {sizes:?} = {declared} bytes of data, file holds {}",
                    data.len()
                ),
            ));
        }

        Ok(IdxRawData { sizes, data })
    }
}

/// Loads an IDX image/label pair as unit-scaled pixels with one-hot targets.
pub fn load(images_path: &Path, labels_path: &Path) -> Result<Dataset> {
    let images_data = IdxRawData::new(images_path, IMAGES_MAGIC)?;
    let label_data = IdxRawData::new(labels_path, LABELS_MAGIC)?;

    let num_images = images_data.sizes[0];
    if label_data.sizes[0] != num_images {
        return Err(Error::dataset(
            labels_path,
            format!(
                "{} labels for {num_images} images",
                label_data.sizes[0]
            ),
        ));
    }
    let image_shape = images_data.sizes[1]
        .checked_mul(images_data.sizes[2])
        .ok_or_else(|| Error::dataset(images_path, "declared image size overflows"))?;

    let pixels: Vec<f64> = images_data
        .data
        .iter()
        .map(|&x| x as f64 / 255.)
        .collect();
    let images = Array2::from_shape_vec((num_images, image_shape), pixels)
        .map_err(|err| Error::dataset(images_path, err.to_string()))?;

    let mut targets = Array2::<f64>::zeros((num_images, NUM_CLASSES));
    for (row, &label) in label_data.data.iter().enumerate() {
        let label = label as usize;
        if label >= NUM_CLASSES {
            return Err(Error::dataset(
                labels_path,
                format!("label {label} at item {row} is not a digit"),
            ));
        }
        targets[[row, label]] = 1.0;
    }

    info!(
        "{} inputs dims: {:?}, outputs dims: {:?}",
        images_path.display(),
        images.dim(),
        targets.dim()
    );

    Dataset::new(images, targets)
}
