//! # Kernel-Masked 3D ResNet-50 Assembler
//!
//! Wires the stem, four residual stages, global pooling, and the optional
//! classifier into a [`Graph`]. Per stage, the first convolution of every
//! bottleneck block is split into a kernel-masked temporal branch and a
//! spatial-preserving branch according to the configured channel ratio;
//! stages with ratio 0 or 1 instantiate only the surviving branch, so no
//! dead parameters exist.

use crate::arch::config::{MaskInit, Ratios, Temperature};
use crate::graph::{Conv3dSpec, Graph, MaskVariant, NodeId, NodeKind};

/// Bottleneck output expansion factor (ResNet-50 family).
pub const EXPANSION: usize = 4;

/// Feature dimension after global pooling.
pub const FEATURE_DIM: usize = 512 * EXPANSION;

const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];
const STAGE_BLOCKS_R50: [usize; 4] = [3, 4, 6, 3];
// (spatial stride, temporal stride) applied by each stage's first block.
const STAGE_STRIDES: [(usize, usize); 4] = [(1, 1), (2, 1), (2, 2), (2, 2)];

/// Which bottleneck flavor the temporal branch uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVariant {
    /// Temporal convolution stores a 3-tap `(3, 1, 1)` kernel; the mask
    /// multiplies it directly.
    V1,
    /// Temporal convolution stores a single-tap `(1, 1, 1)` kernel,
    /// replicated and renormalized at mask-apply time.
    V2,
}

impl BlockVariant {
    fn mask_variant(self) -> MaskVariant {
        match self {
            BlockVariant::V1 => MaskVariant::ThreeTap,
            BlockVariant::V2 => MaskVariant::SingleTap,
        }
    }

    fn temporal_kernel(self) -> ([usize; 3], [usize; 3]) {
        match self {
            BlockVariant::V1 => ([3, 1, 1], [1, 0, 0]),
            BlockVariant::V2 => ([1, 1, 1], [0, 0, 0]),
        }
    }
}

/// How a block's first-convolution output channels are divided between the
/// branches. The three cases are exhaustive over the ratio range, so branch
/// presence never needs runtime null-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSplit {
    TemporalOnly { t_channels: usize },
    SpatialOnly { p_channels: usize },
    Mixed { t_channels: usize, p_channels: usize },
}

impl BranchSplit {
    /// Splits `planes` output channels at `floor(planes * ratio)`; the
    /// spatial branch takes the remainder. A ratio whose floor lands on 0 or
    /// `planes` collapses to a single branch.
    pub fn from_ratio(planes: usize, ratio: f32) -> Self {
        let t_channels = (planes as f32 * ratio).floor() as usize;
        if t_channels == 0 {
            BranchSplit::SpatialOnly { p_channels: planes }
        } else if t_channels == planes {
            BranchSplit::TemporalOnly { t_channels }
        } else {
            BranchSplit::Mixed {
                t_channels,
                p_channels: planes - t_channels,
            }
        }
    }
}

/// Full model configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KmResNet3dConfig {
    pub variant: BlockVariant,
    pub ratios: Ratios,
    pub temperature: Temperature,
    pub mask_init: MaskInit,
    pub num_classes: usize,
    /// When set, the classifier head is omitted and the graph ends at the
    /// flattened pooled features.
    pub feature_only: bool,
}

impl KmResNet3dConfig {
    /// Dimension of the flattened feature vector this configuration emits.
    pub fn feature_dim(&self) -> usize {
        FEATURE_DIM
    }

    /// Builds the ResNet-50 variant of the architecture.
    pub fn build(&self) -> Graph {
        let mut asm = Assembler {
            graph: Graph::new(),
            config: *self,
            inplanes: STAGE_PLANES[0],
        };

        let x = asm.graph.add("input", NodeKind::Input, vec![]);
        let x = asm.conv(
            "conv1",
            Conv3dSpec {
                in_channels: 3,
                out_channels: 64,
                kernel: [1, 7, 7],
                stride: [1, 2, 2],
                padding: [0, 3, 3],
                bias: false,
            },
            x,
        );
        let x = asm.bn("bn1", 64, x);
        let x = asm.relu("relu", x);
        let mut x = asm.graph.add(
            "maxpool",
            NodeKind::MaxPool3d {
                kernel: [1, 3, 3],
                stride: [1, 2, 2],
                padding: [0, 1, 1],
            },
            vec![x],
        );

        for stage in 1..=4 {
            x = asm.stage(stage, STAGE_BLOCKS_R50[stage - 1], x);
        }

        let x = asm.graph.add("avgpool", NodeKind::GlobalAvgPool, vec![x]);
        let x = asm.graph.add("flatten", NodeKind::Flatten, vec![x]);
        if !self.feature_only {
            asm.graph.add(
                "fc",
                NodeKind::Linear {
                    in_features: FEATURE_DIM,
                    out_features: self.num_classes,
                },
                vec![x],
            );
        }

        log::debug!(
            "assembled km-resnet50-3d ({:?}): {} nodes, {} parameters",
            self.variant,
            asm.graph.nodes().len(),
            asm.graph.parameter_shapes().len()
        );
        asm.graph
    }
}

/// The exported configuration of the original model family: v2 blocks, even
/// channel split in every stage, temperature 1/16, zero-initialized mask
/// logits.
pub fn km_resnet50_3d_v2_zero_init(feature_only: bool) -> KmResNet3dConfig {
    KmResNet3dConfig {
        variant: BlockVariant::V2,
        ratios: Ratios::half(),
        temperature: Temperature::RECIPROCAL_16,
        mask_init: MaskInit::Zeros,
        num_classes: 1000,
        feature_only,
    }
}

struct Assembler {
    graph: Graph,
    config: KmResNet3dConfig,
    inplanes: usize,
}

impl Assembler {
    fn conv(&mut self, name: impl Into<String>, spec: Conv3dSpec, input: NodeId) -> NodeId {
        self.graph.add(name, NodeKind::Conv3d(spec), vec![input])
    }

    fn bn(&mut self, name: impl Into<String>, num_features: usize, input: NodeId) -> NodeId {
        self.graph
            .add(name, NodeKind::BatchNorm3d { num_features }, vec![input])
    }

    fn relu(&mut self, name: impl Into<String>, input: NodeId) -> NodeId {
        self.graph.add(name, NodeKind::Relu, vec![input])
    }

    fn stage(&mut self, stage: usize, blocks: usize, mut x: NodeId) -> NodeId {
        let planes = STAGE_PLANES[stage - 1];
        let ratio = self.config.ratios.stage(stage);
        let (stride, t_stride) = STAGE_STRIDES[stage - 1];
        x = self.bottleneck(&format!("layer{stage}.0"), planes, ratio, stride, t_stride, x);
        for block in 1..blocks {
            x = self.bottleneck(&format!("layer{stage}.{block}"), planes, ratio, 1, 1, x);
        }
        x
    }

    /// Masked temporal branch: a parameter-only mask node feeding the
    /// temporal convolution.
    fn temporal_branch(
        &mut self,
        prefix: &str,
        t_channels: usize,
        t_stride: usize,
        x: NodeId,
    ) -> NodeId {
        let km = self.graph.add(
            format!("{prefix}.km"),
            NodeKind::KernelMask {
                channels: t_channels,
                temperature: self.config.temperature,
                init: self.config.mask_init,
            },
            vec![],
        );
        let (kernel, padding) = self.config.variant.temporal_kernel();
        self.graph.add(
            format!("{prefix}.conv1_t"),
            NodeKind::MaskedConv3d {
                spec: Conv3dSpec {
                    in_channels: self.inplanes,
                    out_channels: t_channels,
                    kernel,
                    stride: [t_stride, 1, 1],
                    padding,
                    bias: false,
                },
                variant: self.config.variant.mask_variant(),
            },
            vec![x, km],
        )
    }

    fn spatial_branch(
        &mut self,
        prefix: &str,
        p_channels: usize,
        t_stride: usize,
        x: NodeId,
    ) -> NodeId {
        self.conv(
            format!("{prefix}.conv1_p"),
            Conv3dSpec {
                in_channels: self.inplanes,
                out_channels: p_channels,
                kernel: [1, 1, 1],
                stride: [t_stride, 1, 1],
                padding: [0, 0, 0],
                bias: false,
            },
            x,
        )
    }

    fn bottleneck(
        &mut self,
        prefix: &str,
        planes: usize,
        ratio: f32,
        stride: usize,
        t_stride: usize,
        x: NodeId,
    ) -> NodeId {
        let first = match BranchSplit::from_ratio(planes, ratio) {
            BranchSplit::TemporalOnly { t_channels } => {
                self.temporal_branch(prefix, t_channels, t_stride, x)
            }
            BranchSplit::SpatialOnly { p_channels } => {
                self.spatial_branch(prefix, p_channels, t_stride, x)
            }
            BranchSplit::Mixed {
                t_channels,
                p_channels,
            } => {
                let t = self.temporal_branch(prefix, t_channels, t_stride, x);
                let p = self.spatial_branch(prefix, p_channels, t_stride, x);
                self.graph
                    .add(format!("{prefix}.cat"), NodeKind::Concat, vec![t, p])
            }
        };

        let out = self.bn(format!("{prefix}.bn1"), planes, first);
        let out = self.relu(format!("{prefix}.relu1"), out);
        let out = self.conv(
            format!("{prefix}.conv2"),
            Conv3dSpec {
                in_channels: planes,
                out_channels: planes,
                kernel: [1, 3, 3],
                stride: [1, stride, stride],
                padding: [0, 1, 1],
                bias: false,
            },
            out,
        );
        let out = self.bn(format!("{prefix}.bn2"), planes, out);
        let out = self.relu(format!("{prefix}.relu2"), out);
        let out = self.conv(
            format!("{prefix}.conv3"),
            Conv3dSpec {
                in_channels: planes,
                out_channels: planes * EXPANSION,
                kernel: [1, 1, 1],
                stride: [1, 1, 1],
                padding: [0, 0, 0],
                bias: false,
            },
            out,
        );
        let out = self.bn(format!("{prefix}.bn3"), planes * EXPANSION, out);

        let residual = if stride != 1 || self.inplanes != planes * EXPANSION {
            let d = self.conv(
                format!("{prefix}.downsample.0"),
                Conv3dSpec {
                    in_channels: self.inplanes,
                    out_channels: planes * EXPANSION,
                    kernel: [1, 1, 1],
                    stride: [t_stride, stride, stride],
                    padding: [0, 0, 0],
                    bias: false,
                },
                x,
            );
            self.bn(format!("{prefix}.downsample.1"), planes * EXPANSION, d)
        } else {
            x
        };

        let out = self
            .graph
            .add(format!("{prefix}.add"), NodeKind::Add, vec![out, residual]);
        self.inplanes = planes * EXPANSION;
        self.relu(format!("{prefix}.relu3"), out)
    }
}
