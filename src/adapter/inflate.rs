//! # Dimensional Inflation
//!
//! Converts surviving 2D kernels into 3D kernels: a singleton temporal axis
//! is inserted after the input-channel dimension, and when the target
//! temporal length exceeds 1 the kernel is replicated across it and divided
//! by the length, so the inflated convolution initially reproduces the 2D
//! response. Keys are independent, so the pass runs in parallel.

use super::AdapterError;
use crate::state::{StateDict, TensorData};
use ndarray::IxDyn;
use rayon::prelude::*;

/// Axis position where the temporal dimension is inserted (immediately
/// after the input-channel dimension).
const TEMPORAL_AXIS: usize = 2;

/// Inflates every entry of `survivors` whose shape differs from its target
/// counterpart. Every key in `survivors` must exist in `target` (the caller
/// filters beforehand); equal-shape entries pass through unchanged.
pub(crate) fn inflate_all(
    survivors: StateDict,
    target: &StateDict,
) -> Result<StateDict, AdapterError> {
    survivors
        .into_par_iter()
        .map(|(key, weight)| {
            let expected = target
                .get(&key)
                .ok_or_else(|| AdapterError::MissingTargetKey(key.clone()))?;
            if weight.shape() == expected.shape() {
                return Ok((key, weight));
            }
            let inflated = inflate(&key, weight, expected.shape())?;
            Ok((key, inflated))
        })
        .collect()
}

fn inflate(
    key: &str,
    weight: ndarray::ArrayD<TensorData>,
    target_shape: &[usize],
) -> Result<ndarray::ArrayD<TensorData>, AdapterError> {
    let shape = weight.shape().to_vec();

    // To inflate, channel counts and the spatial kernel extent must agree;
    // only the temporal axis may be new. Anything else is a fatal
    // incompatibility, never a silent reshape.
    let compatible = shape.len() >= 4
        && target_shape.len() == shape.len() + 1
        && shape[..TEMPORAL_AXIS] == target_shape[..TEMPORAL_AXIS]
        && shape[shape.len() - 2..] == target_shape[target_shape.len() - 2..];
    if !compatible {
        return Err(AdapterError::ShapeIncompatible {
            key: key.to_string(),
            pretrained: shape,
            target: target_shape.to_vec(),
        });
    }

    log::info!("layer {key} needs inflation: {shape:?} -> {target_shape:?}");

    let mut inserted = shape.clone();
    inserted.insert(TEMPORAL_AXIS, 1);
    let reshaped = weight
        .into_shape(IxDyn(&inserted))
        .map_err(|_| AdapterError::InflationMismatch {
            key: key.to_string(),
            inflated: inserted.clone(),
            target: target_shape.to_vec(),
        })?;

    let t_length = target_shape[TEMPORAL_AXIS];
    let inflated = if t_length == 1 {
        reshaped
    } else {
        // Replicate across the new axis and spread the magnitude evenly.
        let replicated = reshaped
            .broadcast(IxDyn(target_shape))
            .ok_or_else(|| AdapterError::InflationMismatch {
                key: key.to_string(),
                inflated: inserted.clone(),
                target: target_shape.to_vec(),
            })?
            .to_owned();
        replicated / t_length as TensorData
    };

    if inflated.shape() != target_shape {
        return Err(AdapterError::InflationMismatch {
            key: key.to_string(),
            inflated: inflated.shape().to_vec(),
            target: target_shape.to_vec(),
        });
    }
    Ok(inflated)
}
