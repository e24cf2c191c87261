use anyhow::{anyhow, Context, Result};
use ndarray::Array3;
use ndarray_npy::{NpzReader, NpzWriter};
use std::fs::File;
use std::path::Path;

use crate::Volume3;

/// Array name holding the intensity volume inside training archives.
pub const DEFAULT_VOLUME_KEY: &str = "vol";

/// Read a 3D volume stored under `key` in a `.npz` archive.
///
/// Both `key` and `key.npy` entry names are accepted, and `f64` arrays are
/// narrowed to `f32`.
pub fn read_npz_volume<P: AsRef<Path>>(path: P, key: &str) -> Result<Volume3> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut npz = NpzReader::new(file)
        .with_context(|| format!("Failed to read npz archive {}", path.display()))?;

    let names = npz.names().context("Failed to list npz entries")?;
    let entry = names
        .iter()
        .find(|name| name.as_str() == key || name.trim_end_matches(".npy") == key)
        .cloned()
        .ok_or_else(|| anyhow!("{} has no array named '{}' (found {:?})", path.display(), key, names))?;

    let single: std::result::Result<Array3<f32>, _> = npz.by_name(&entry);
    match single {
        Ok(volume) => Ok(volume),
        Err(_) => {
            let double: Array3<f64> = npz
                .by_name(&entry)
                .with_context(|| format!("'{}' in {} is not a 3D float array", key, path.display()))?;
            Ok(double.mapv(|v| v as f32))
        }
    }
}

/// Write a 3D volume to a `.npz` archive under `key`.
pub fn write_npz_volume<P: AsRef<Path>>(path: P, key: &str, volume: &Volume3) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut npz = NpzWriter::new(file);
    npz.add_array(format!("{}.npy", key), volume)
        .with_context(|| format!("Failed to write '{}' to {}", key, path.display()))?;
    npz.finish().context("Failed to finalize npz archive")?;
    Ok(())
}
