//! # State-Dict Serialization
//!
//! Saving and loading state dicts, e.g. to persist an adapted initialization
//! or to hand a pretrained 2D checkpoint to the adapter in this crate's own
//! format. Uses `serde` with `bincode` as the binary encoding; each tensor
//! is stored as its shape plus a flat data vector.

use crate::state::{StateDict, TensorData};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("tensor '{key}' declares shape {shape:?} but carries {len} elements")]
    Malformed {
        key: String,
        shape: Vec<usize>,
        len: usize,
    },
}

/// On-disk form of a single tensor.
#[derive(Serialize, Deserialize, Debug)]
struct SerializableTensor {
    shape: Vec<usize>,
    data: Vec<TensorData>,
}

impl SerializableTensor {
    fn from_array(array: &ArrayD<TensorData>) -> Self {
        SerializableTensor {
            shape: array.shape().to_vec(),
            // iter() walks logical order, so non-standard layouts round-trip.
            data: array.iter().copied().collect(),
        }
    }

    fn into_array(self, key: &str) -> Result<ArrayD<TensorData>, SerializationError> {
        let len = self.data.len();
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data).map_err(|_| {
            SerializationError::Malformed {
                key: key.to_string(),
                shape: self.shape,
                len,
            }
        })
    }
}

/// Writes a state dict to `path`.
pub fn save_state<P: AsRef<Path>>(state: &StateDict, path: P) -> Result<(), SerializationError> {
    let on_disk: BTreeMap<&String, SerializableTensor> = state
        .iter()
        .map(|(k, v)| (k, SerializableTensor::from_array(v)))
        .collect();
    let writer = BufWriter::new(File::create(path.as_ref())?);
    bincode::serialize_into(writer, &on_disk)?;
    Ok(())
}

/// Reads a state dict from `path`.
pub fn load_state<P: AsRef<Path>>(path: P) -> Result<StateDict, SerializationError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let on_disk: BTreeMap<String, SerializableTensor> = bincode::deserialize_from(reader)?;
    on_disk
        .into_iter()
        .map(|(key, tensor)| {
            let array = tensor.into_array(&key)?;
            Ok((key, array))
        })
        .collect()
}
