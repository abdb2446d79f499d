//! # Kernel Mask
//!
//! The temporal branch of a block's first convolution does not convolve with
//! its raw weight: the weight is modulated by a learned, per-output-channel
//! soft mask over the 3 temporal kernel taps. The mask is a temperature-
//! scaled softmax of a `[channels, 1, 3, 1, 1]` logit tensor, rescaled by 3
//! so each channel's taps sum to 3 rather than 1 and the expected activation
//! magnitude matches an unmasked 3-tap average.

use crate::arch::config::Temperature;
use crate::state::TensorData;
use ndarray::{concatenate, ArrayD, Axis};

/// Temporal kernel length the mask spans. The architecture only ever masks
/// 3-tap temporal kernels.
pub const TEMPORAL_TAPS: usize = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MaskError {
    #[error("mask logits must have shape [channels, 1, 3, 1, 1], got {0:?}")]
    BadLogitShape(Vec<usize>),
    #[error("masked weight must be 5-D with {expected} temporal taps, got shape {got:?}")]
    BadWeightShape { expected: usize, got: Vec<usize> },
    #[error("mask covers {mask} output channels but weight has {weight}")]
    ChannelMismatch { mask: usize, weight: usize },
}

/// Expected logit shape for a temporal branch with `channels` outputs.
pub fn logit_shape(channels: usize) -> [usize; 5] {
    [channels, 1, TEMPORAL_TAPS, 1, 1]
}

/// Computes the soft mask from raw logits: `3 * softmax(logits / T)` along
/// the temporal axis (axis 2). Output shape equals the logit shape; each
/// channel's three taps sum to exactly 3.
pub fn kernel_mask(
    logits: &ArrayD<TensorData>,
    temperature: Temperature,
) -> Result<ArrayD<TensorData>, MaskError> {
    let shape = logits.shape();
    if shape.len() != 5
        || shape[1] != 1
        || shape[2] != TEMPORAL_TAPS
        || shape[3] != 1
        || shape[4] != 1
    {
        return Err(MaskError::BadLogitShape(shape.to_vec()));
    }

    let mut mask = logits.mapv(|x| x / temperature.get());
    for mut lane in mask.lanes_mut(Axis(2)) {
        // Max-shifted softmax; exact for equal logits (each tap lands on 1.0).
        let max = lane.fold(TensorData::NEG_INFINITY, |acc, &x| acc.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum * TEMPORAL_TAPS as TensorData);
    }
    Ok(mask)
}

/// Variant 1: the temporal convolution already carries a 3-tap kernel
/// `[C, C_in, 3, h, w]`; the mask multiplies it in place, broadcast over the
/// input-channel and spatial axes.
pub fn apply_v1(
    mask: &ArrayD<TensorData>,
    weight: &ArrayD<TensorData>,
) -> Result<ArrayD<TensorData>, MaskError> {
    let shape = weight.shape();
    if shape.len() != 5 || shape[2] != TEMPORAL_TAPS {
        return Err(MaskError::BadWeightShape {
            expected: TEMPORAL_TAPS,
            got: shape.to_vec(),
        });
    }
    if mask.shape()[0] != shape[0] {
        return Err(MaskError::ChannelMismatch {
            mask: mask.shape()[0],
            weight: shape[0],
        });
    }
    Ok(weight * mask)
}

/// Variant 2: the temporal convolution carries a single-tap kernel
/// `[C, C_in, 1, h, w]`; it is replicated to 3 taps and divided by 3 (so the
/// unmasked response equals the original single-tap response) before the
/// mask is applied.
pub fn apply_v2(
    mask: &ArrayD<TensorData>,
    weight: &ArrayD<TensorData>,
) -> Result<ArrayD<TensorData>, MaskError> {
    let shape = weight.shape();
    if shape.len() != 5 || shape[2] != 1 {
        return Err(MaskError::BadWeightShape {
            expected: 1,
            got: shape.to_vec(),
        });
    }
    let replicated = concatenate(
        Axis(2),
        &[weight.view(), weight.view(), weight.view()],
    )
    .map_err(|_| MaskError::BadWeightShape {
        expected: 1,
        got: shape.to_vec(),
    })?;
    apply_v1(mask, &(replicated / TEMPORAL_TAPS as TensorData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn temp(t: f32) -> Temperature {
        Temperature::new(t).unwrap()
    }

    #[test]
    fn equal_logits_give_unit_mask() {
        // Uniform softmax is 1/3 per tap; times 3 it is exactly 1.0.
        for logits in [
            ArrayD::zeros(IxDyn(&logit_shape(8))),
            ArrayD::ones(IxDyn(&logit_shape(8))),
        ] {
            let mask = kernel_mask(&logits, temp(1.0 / 16.0)).unwrap();
            assert!(mask.iter().all(|&m| m == 1.0));
        }
    }

    #[test]
    fn mask_sums_to_taps_per_channel() {
        let mut logits = ArrayD::zeros(IxDyn(&logit_shape(2)));
        logits[IxDyn(&[0, 0, 1, 0, 0])] = 2.0;
        logits[IxDyn(&[1, 0, 2, 0, 0])] = -3.5;
        let mask = kernel_mask(&logits, temp(0.5)).unwrap();
        for lane in mask.lanes(Axis(2)) {
            assert!((lane.sum() - TEMPORAL_TAPS as f32).abs() < 1e-5);
        }
    }

    #[test]
    fn low_temperature_sharpens_towards_top_tap() {
        let mut logits = ArrayD::zeros(IxDyn(&logit_shape(1)));
        logits[IxDyn(&[0, 0, 1, 0, 0])] = 1.0;
        let sharp = kernel_mask(&logits, temp(1.0 / 16.0)).unwrap();
        let soft = kernel_mask(&logits, temp(1.0)).unwrap();
        let peak = IxDyn(&[0, 0, 1, 0, 0]);
        assert!(sharp[peak.clone()] > soft[peak]);
        // At T = 1/16 the winning tap takes essentially the whole mass.
        assert!(sharp[IxDyn(&[0, 0, 1, 0, 0])] > 2.99);
    }

    #[test]
    fn rejects_malformed_logits() {
        let bad = ArrayD::<f32>::zeros(IxDyn(&[4, 1, 2, 1, 1]));
        assert!(matches!(
            kernel_mask(&bad, temp(1.0)),
            Err(MaskError::BadLogitShape(_))
        ));
    }

    #[test]
    fn apply_v1_broadcasts_over_input_and_space() {
        let mask = kernel_mask(&ArrayD::zeros(IxDyn(&logit_shape(2))), temp(1.0)).unwrap();
        let weight = ArrayD::from_elem(IxDyn(&[2, 4, 3, 1, 1]), 0.5f32);
        let masked = apply_v1(&mask, &weight).unwrap();
        // Unit mask leaves the weight untouched.
        assert_eq!(masked, weight);
    }

    #[test]
    fn apply_v2_replicates_and_normalizes() {
        let mask = kernel_mask(&ArrayD::zeros(IxDyn(&logit_shape(2))), temp(1.0)).unwrap();
        let weight = ArrayD::from_elem(IxDyn(&[2, 4, 1, 1, 1]), 0.9f32);
        let masked = apply_v2(&mask, &weight).unwrap();
        assert_eq!(masked.shape(), &[2, 4, 3, 1, 1]);
        // Each of the 3 taps holds weight/3; summed over taps the original
        // single-tap response is preserved.
        for &v in masked.iter() {
            assert!((v - 0.3).abs() < 1e-6);
        }
    }

    #[test]
    fn apply_v2_rejects_multi_tap_weight() {
        let mask = kernel_mask(&ArrayD::zeros(IxDyn(&logit_shape(2))), temp(1.0)).unwrap();
        let weight = ArrayD::<f32>::zeros(IxDyn(&[2, 4, 3, 1, 1]));
        assert!(apply_v2(&mask, &weight).is_err());
    }
}
