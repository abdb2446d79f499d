//! # State Dictionaries
//!
//! The core data model shared by the assembler and the adapter: a state dict
//! maps a hierarchical parameter name (e.g. `layer2.1.conv1.weight`) to its
//! tensor. `BTreeMap` keeps iteration order deterministic, which makes diffs
//! and the adapter's filtering pass reproducible.

use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Underlying element type for all parameters.
pub type TensorData = f32;

/// Parameter name -> tensor. Pretrained checkpoints, freshly initialized
/// model state, and the adapter's output all use this shape.
pub type StateDict = BTreeMap<String, ArrayD<TensorData>>;

/// Parameter name -> shape. Used when only the shape bookkeeping matters.
pub type ShapeMap = BTreeMap<String, Vec<usize>>;

/// Derives the shape-only view of a state dict.
pub fn shape_map(state: &StateDict) -> ShapeMap {
    state
        .iter()
        .map(|(k, v)| (k.clone(), v.shape().to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn shape_map_reflects_tensor_shapes() {
        let mut state = StateDict::new();
        state.insert(
            "conv1.weight".to_string(),
            ArrayD::zeros(ndarray::IxDyn(&[64, 3, 7, 7])),
        );
        let shapes = shape_map(&state);
        assert_eq!(shapes["conv1.weight"], vec![64, 3, 7, 7]);
    }
}
