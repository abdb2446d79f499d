//! # Architecture Assembler
//!
//! Builds the kernel-masked 3D ResNet as an explicit computation graph.
//! [`config`] holds the caller-facing knobs (stage ratios, temperature, mask
//! init, checkpoint zoo); [`resnet`] wires the stem, the four residual
//! stages, the global pool, and the optional classifier.

pub mod config;
pub mod resnet;

pub use config::{ConfigError, MaskInit, Ratios, Temperature, ZooConfig};
pub use resnet::{km_resnet50_3d_v2_zero_init, BlockVariant, BranchSplit, KmResNet3dConfig};
