//! # Checkpoint Adapter
//!
//! Maps a 2D ImageNet-pretrained state dict onto the 3D network. Three
//! passes run in order:
//!
//! 1. **Split**: first-block input-projection weights are sliced into
//!    temporal/spatial sub-tensors per the configured stage ratios.
//! 2. **Filter**: only keys the target model actually declares survive.
//!    Pretrained keys without a counterpart (e.g. the classifier head in
//!    feature-extraction mode) are dropped; target keys without a
//!    pretrained counterpart keep their freshly initialized values.
//! 3. **Inflate**: surviving 2D kernels gain a temporal axis,
//!    replicated and renormalized when the target temporal length exceeds 1.
//!
//! The whole operation is a pure function of its inputs: the pretrained and
//! target dicts are never mutated, and re-invocation is deterministic.

use crate::arch::config::Ratios;
use crate::state::StateDict;

mod inflate;
mod split;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error(
        "cannot inflate '{key}': pretrained shape {pretrained:?} is incompatible \
         with target shape {target:?} (channel counts and spatial kernel must match)"
    )]
    ShapeIncompatible {
        key: String,
        pretrained: Vec<usize>,
        target: Vec<usize>,
    },
    #[error("inflated '{key}' to {inflated:?} but target expects {target:?}")]
    InflationMismatch {
        key: String,
        inflated: Vec<usize>,
        target: Vec<usize>,
    },
    #[error("key '{0}' survived filtering but is absent from the target map")]
    MissingTargetKey(String),
}

/// Produces the initialization state for the 3D model: `target` (the
/// freshly initialized model state) updated with every pretrained tensor
/// that could be split, matched, and inflated. The output's key set exactly
/// equals `target`'s.
pub fn adapt(
    pretrained: &StateDict,
    target: &StateDict,
    ratios: &Ratios,
) -> Result<StateDict, AdapterError> {
    let merged = split::split_stage_convs(pretrained, ratios);
    let survivors: StateDict = merged
        .into_iter()
        .filter(|(key, _)| target.contains_key(key))
        .collect();
    let adapted = inflate::inflate_all(survivors, target)?;

    let mut out = target.clone();
    out.extend(adapted);
    Ok(out)
}
