//! # km-resnet3d
//!
//! Architecture definition for a kernel-masked 3D ResNet-50 used for video
//! recognition, plus the checkpoint adapter that transplants a 2D
//! ImageNet-pretrained state dict onto the 3D network.
//!
//! Two components live here:
//! * an **architecture assembler** ([`arch`]) that builds the network as an
//!   explicit computation graph ([`graph`]) parameterized by per-stage
//!   temporal/spatial channel ratios and a softmax temperature, and
//! * a **checkpoint adapter** ([`adapter`]) that splits first-block
//!   input-projection weights into temporal/spatial sub-tensors and inflates
//!   the remaining 2D kernels into 3D kernels.
//!
//! Convolution, batch-norm, and pooling kernels are external collaborators
//! behind the [`graph::eval::Backend`] trait; this crate owns only the graph
//! description, the mask math, and the state-dict transformation.

pub mod adapter;
pub mod arch;
pub mod graph;
pub mod mask;
pub mod state;
pub mod utils;

pub use adapter::{adapt, AdapterError};
pub use arch::config::{MaskInit, Ratios, Temperature, ZooConfig};
pub use arch::resnet::{km_resnet50_3d_v2_zero_init, BlockVariant, KmResNet3dConfig};
pub use state::{ShapeMap, StateDict, TensorData};
