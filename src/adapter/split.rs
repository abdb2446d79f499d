//! # Stage-Aware Key Splitter
//!
//! Pretrained 2D checkpoints carry one `layerN.M.conv1.weight` per block;
//! the 3D network replaces that convolution with a temporal/spatial branch
//! pair. This pass slices each matching weight along its output-channel axis
//! according to the stage's ratio and merges the renamed entries alongside
//! the originals (which a later filter discards, since no target key matches
//! them).

use crate::arch::config::{Ratios, STAGES};
use crate::state::StateDict;
use ndarray::{Axis, Slice};

const FIRST_CONV_MARKER: &str = ".conv1.weight";

/// Extracts the 1-based stage index from a key of the form
/// `layer<N>...conv1.weight`, if the key names a block's first convolution.
fn stage_of(key: &str) -> Option<usize> {
    if !key.contains(FIRST_CONV_MARKER) {
        return None;
    }
    let after = key.find("layer")? + "layer".len();
    let stage = key[after..].chars().next()?.to_digit(10)? as usize;
    (1..=STAGES).contains(&stage).then_some(stage)
}

/// Returns a copy of `pretrained` with the split `conv1_t` / `conv1_p`
/// entries merged in. Non-matching keys pass through untouched.
pub(crate) fn split_stage_convs(pretrained: &StateDict, ratios: &Ratios) -> StateDict {
    let mut merged = pretrained.clone();

    for (key, weight) in pretrained {
        let Some(stage) = stage_of(key) else {
            continue;
        };
        let ratio = ratios.stage(stage);
        let out_channels = weight.shape()[0];
        let slice_index = (out_channels as f32 * ratio).floor() as usize;
        let marker = key.find(FIRST_CONV_MARKER).expect("checked by stage_of");
        let prefix = &key[..marker];

        if ratio == 1.0 {
            merged.insert(format!("{prefix}.conv1_t.weight"), weight.clone());
        } else if ratio == 0.0 {
            merged.insert(format!("{prefix}.conv1_p.weight"), weight.clone());
        } else {
            merged.insert(
                format!("{prefix}.conv1_t.weight"),
                weight
                    .slice_axis(Axis(0), Slice::from(..slice_index))
                    .to_owned(),
            );
            merged.insert(
                format!("{prefix}.conv1_p.weight"),
                weight
                    .slice_axis(Axis(0), Slice::from(slice_index..))
                    .to_owned(),
            );
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{concatenate, ArrayD, IxDyn};

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|i| i as f32).collect())
            .expect("shape/product agree")
    }

    fn one_key(key: &str, shape: &[usize]) -> StateDict {
        let mut dict = StateDict::new();
        dict.insert(key.to_string(), ramp(shape));
        dict
    }

    #[test]
    fn stage_of_recognizes_first_convs_only() {
        assert_eq!(stage_of("layer2.1.conv1.weight"), Some(2));
        assert_eq!(stage_of("layer4.0.conv1.weight"), Some(4));
        assert_eq!(stage_of("layer2.1.conv2.weight"), None);
        assert_eq!(stage_of("conv1.weight"), None); // stem, no stage
        assert_eq!(stage_of("layer9.0.conv1.weight"), None);
    }

    #[test]
    fn half_ratio_slices_reconstruct_original() {
        let dict = one_key("layer1.0.conv1.weight", &[64, 64, 1, 1]);
        let ratios = Ratios::new([0.5; 4]).unwrap();
        let merged = split_stage_convs(&dict, &ratios);

        let t = &merged["layer1.0.conv1_t.weight"];
        let p = &merged["layer1.0.conv1_p.weight"];
        assert_eq!(t.shape(), &[32, 64, 1, 1]);
        assert_eq!(p.shape(), &[32, 64, 1, 1]);

        // Temporal takes channels [0, 32), spatial [32, 64); concatenated in
        // that order they are exactly the original tensor.
        let rejoined = concatenate(Axis(0), &[t.view(), p.view()]).unwrap();
        assert_eq!(rejoined, merged["layer1.0.conv1.weight"]);
    }

    #[test]
    fn ratio_zero_emits_only_spatial_full_tensor() {
        let dict = one_key("layer3.2.conv1.weight", &[256, 1024, 1, 1]);
        let ratios = Ratios::new([0.5, 0.5, 0.0, 0.5]).unwrap();
        let merged = split_stage_convs(&dict, &ratios);
        assert!(!merged.contains_key("layer3.2.conv1_t.weight"));
        assert_eq!(
            merged["layer3.2.conv1_p.weight"],
            merged["layer3.2.conv1.weight"]
        );
    }

    #[test]
    fn ratio_one_emits_only_temporal_full_tensor() {
        let dict = one_key("layer2.0.conv1.weight", &[128, 256, 1, 1]);
        let ratios = Ratios::new([0.5, 1.0, 0.5, 0.5]).unwrap();
        let merged = split_stage_convs(&dict, &ratios);
        assert!(!merged.contains_key("layer2.0.conv1_p.weight"));
        assert_eq!(
            merged["layer2.0.conv1_t.weight"],
            merged["layer2.0.conv1.weight"]
        );
    }

    #[test]
    fn non_matching_keys_pass_through() {
        let mut dict = one_key("conv1.weight", &[64, 3, 7, 7]);
        dict.insert("layer1.0.conv2.weight".to_string(), ramp(&[64, 64, 3, 3]));
        dict.insert("fc.weight".to_string(), ramp(&[1000, 2048]));
        let ratios = Ratios::half();
        let merged = split_stage_convs(&dict, &ratios);
        assert_eq!(merged.len(), dict.len());
        for key in dict.keys() {
            assert_eq!(merged[key], dict[key]);
        }
    }
}
