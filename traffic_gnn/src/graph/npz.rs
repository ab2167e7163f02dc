use crate::graph::error::{CheckpointError, DataError};
use ndarray::{Array, ArrayD, ArrayView, Dimension, IxDyn};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpyExt, ReadableElement};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub type NpzFile = NpzReader<File>;

pub fn open_npz(path: &Path) -> Result<NpzFile, DataError> {
    let file = File::open(path).map_err(|e| DataError::io(path, e))?;
    NpzReader::new(file).map_err(|e| DataError::format(path, e.to_string()))
}

/// Array names without the `.npy` suffix numpy adds on write.
pub fn array_names(npz: &mut NpzFile, path: &Path) -> Result<Vec<String>, DataError> {
    let names = npz.names().map_err(|e| DataError::format(path, e.to_string()))?;
    Ok(names
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect())
}

pub fn read_array<T, D>(npz: &mut NpzFile, path: &Path, key: &str) -> Result<Array<T, D>, DataError>
where
    T: ReadableElement,
    D: Dimension,
{
    match npz.by_name(key) {
        Ok(array) => Ok(array),
        Err(_) => npz
            .by_name(&format!("{key}.npy"))
            .map_err(|e| DataError::format(path, format!("array `{key}`: {e}"))),
    }
}

/// Reads a float array stored either as f32 or f64.
pub fn read_f32_array<D: Dimension>(npz: &mut NpzFile, path: &Path, key: &str) -> Result<Array<f32, D>, DataError> {
    match read_array::<f32, D>(npz, path, key) {
        Ok(array) => Ok(array),
        Err(_) => Ok(read_array::<f64, D>(npz, path, key)?.mapv(|v| v as f32)),
    }
}

pub fn read_f64_array<D: Dimension>(npz: &mut NpzFile, path: &Path, key: &str) -> Result<Array<f64, D>, DataError> {
    match read_array::<f64, D>(npz, path, key) {
        Ok(array) => Ok(array),
        Err(_) => Ok(read_array::<f32, D>(npz, path, key)?.mapv(f64::from)),
    }
}

/// Reads an integer array stored as i32 or i64.
pub fn read_index_array<D: Dimension>(npz: &mut NpzFile, path: &Path, key: &str) -> Result<Array<i64, D>, DataError> {
    match read_array::<i64, D>(npz, path, key) {
        Ok(array) => Ok(array),
        Err(_) => Ok(read_array::<i32, D>(npz, path, key)?.mapv(i64::from)),
    }
}

pub fn read_npy_f64(path: &Path) -> Result<ArrayD<f64>, DataError> {
    let open = || File::open(path).map(BufReader::new).map_err(|e| DataError::io(path, e));

    match ArrayD::<f64>::read_npy(open()?) {
        Ok(array) => Ok(array),
        Err(_) => ArrayD::<f32>::read_npy(open()?)
            .map(|a| a.mapv(f64::from))
            .map_err(|e| DataError::format(path, e.to_string())),
    }
}

/// Writes a compressed archive, refusing to replace an existing file.
pub fn write_compressed(path: &Path, arrays: &[(&str, ArrayView<f32, IxDyn>)]) -> Result<(), CheckpointError> {
    if path.exists() {
        return Err(CheckpointError::Exists(path.to_path_buf()));
    }
    let file = File::create(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let encode = |e: &dyn std::fmt::Display| CheckpointError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let mut npz = NpzWriter::new_compressed(file);
    for (name, array) in arrays {
        npz.add_array(*name, array).map_err(|e| encode(&e))?;
    }
    npz.finish().map_err(|e| encode(&e))?;
    Ok(())
}
