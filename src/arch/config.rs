//! # Model Configuration
//!
//! Caller-supplied knobs for the assembler and adapter. Validation happens at
//! construction time so downstream code can rely on the invariants (exactly
//! four stage ratios, each in `[0, 1]`; strictly positive temperature)
//! without re-checking.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of residual stages in a ResNet-style network.
pub const STAGES: usize = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("ratio vector must have exactly 4 entries, got {0}")]
    WrongStageCount(usize),
    #[error("ratio for stage {stage} must lie in [0, 1], got {value}")]
    RatioOutOfRange { stage: usize, value: f32 },
    #[error("softmax temperature must be positive, got {0}")]
    NonPositiveTemperature(f32),
    #[error("mask init std must be positive and finite, got {0}")]
    InvalidMaskStd(f32),
}

/// Per-stage temporal channel ratios.
///
/// Entry `i` states what fraction of stage `i+1`'s first-block output
/// channels are produced by the temporal branch; the spatial branch takes the
/// remainder. A validated `Ratios` is the only way ratios enter the
/// assembler or the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratios([f32; STAGES]);

impl Ratios {
    pub fn new(ratios: [f32; STAGES]) -> Result<Self, ConfigError> {
        for (i, &r) in ratios.iter().enumerate() {
            if !(0.0..=1.0).contains(&r) {
                return Err(ConfigError::RatioOutOfRange {
                    stage: i + 1,
                    value: r,
                });
            }
        }
        Ok(Ratios(ratios))
    }

    /// Validating constructor for dynamically sized input (e.g. parsed
    /// config files), rejecting any length other than [`STAGES`].
    pub fn from_slice(ratios: &[f32]) -> Result<Self, ConfigError> {
        let arr: [f32; STAGES] = ratios
            .try_into()
            .map_err(|_| ConfigError::WrongStageCount(ratios.len()))?;
        Self::new(arr)
    }

    /// Ratio for a 1-based stage index (1..=4).
    pub fn stage(&self, stage: usize) -> f32 {
        self.0[stage - 1]
    }

    pub fn as_array(&self) -> [f32; STAGES] {
        self.0
    }

    /// The configuration the original model family ships with: every stage
    /// splits channels evenly between the temporal and spatial branches.
    pub fn half() -> Self {
        Ratios([0.5; STAGES])
    }
}

/// Softmax temperature for the kernel mask. Fixed per model configuration,
/// not learned; lower values sharpen the mask towards hard tap selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature(f32);

impl Temperature {
    /// The temperature the shipped kernel-masked ResNet-50 configuration
    /// trains with.
    pub const RECIPROCAL_16: Temperature = Temperature(1.0 / 16.0);

    pub fn new(value: f32) -> Result<Self, ConfigError> {
        if value <= 0.0 {
            return Err(ConfigError::NonPositiveTemperature(value));
        }
        Ok(Temperature(value))
    }

    pub fn get(&self) -> f32 {
        self.0
    }
}

impl Default for Temperature {
    fn default() -> Self {
        Temperature(1.0)
    }
}

/// Initialization policy for the kernel-mask logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaskInit {
    /// All-zero logits: softmax starts uniform across the 3 taps.
    Zeros,
    /// All-one logits: identical to `Zeros` after softmax, kept for
    /// checkpoint compatibility with configurations trained that way.
    Ones,
    /// Logits drawn from `N(0, std^2)`.
    Normal { std: f32 },
}

impl Default for MaskInit {
    fn default() -> Self {
        MaskInit::Zeros
    }
}

/// Checkpoint locations for the 2D pretrained backbones, passed explicitly
/// to whatever fetches checkpoints. Retrieval itself is out of scope; this
/// is configuration data, not an ambient global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZooConfig {
    urls: BTreeMap<String, String>,
}

impl ZooConfig {
    pub fn new(urls: BTreeMap<String, String>) -> Self {
        ZooConfig { urls }
    }

    pub fn url(&self, arch: &str) -> Option<&str> {
        self.urls.get(arch).map(String::as_str)
    }
}

impl Default for ZooConfig {
    fn default() -> Self {
        let mut urls = BTreeMap::new();
        for (arch, url) in [
            ("resnet18", "https://download.pytorch.org/models/resnet18-5c106cde.pth"),
            ("resnet34", "https://download.pytorch.org/models/resnet34-333f7ec4.pth"),
            ("resnet50", "https://download.pytorch.org/models/resnet50-19c8e357.pth"),
            ("resnet101", "https://download.pytorch.org/models/resnet101-5d3b4d8f.pth"),
            ("resnet152", "https://download.pytorch.org/models/resnet152-b121ed2d.pth"),
        ] {
            urls.insert(arch.to_string(), url.to_string());
        }
        ZooConfig { urls }
    }
}
