//! # Computation Graph
//!
//! The network is described as an explicit DAG of plain-data nodes rather
//! than a hierarchy of layer objects with virtual `forward` methods. Each
//! node records its kind (convolution, normalization, activation,
//! elementwise combine, pooling) and enough shape information to derive the
//! model's parameter map; a separate pure routine ([`eval::evaluate`]) walks
//! the graph.
//!
//! Parameter names follow the checkpoint convention of the pretrained 2D
//! backbones (`layer2.1.conv1_t.weight`, `bn1.running_mean`, ...) so the
//! adapter can match keys directly.

use crate::arch::config::{ConfigError, MaskInit, Temperature};
use crate::mask::logit_shape;
use crate::state::{ShapeMap, StateDict, TensorData};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod eval;

pub use eval::{evaluate, Backend, EvalError};

/// Index of a node within its graph. Nodes are stored in topological order;
/// an edge always points from a smaller id to a larger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Shape bookkeeping for a 3D convolution. `kernel`, `stride`, and `padding`
/// are ordered temporal-first: `[t, h, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conv3dSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub bias: bool,
}

impl Conv3dSpec {
    pub fn weight_shape(&self) -> [usize; 5] {
        [
            self.out_channels,
            self.in_channels,
            self.kernel[0],
            self.kernel[1],
            self.kernel[2],
        ]
    }
}

/// How a masked temporal convolution stores its kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskVariant {
    /// The stored kernel already has 3 temporal taps; the mask multiplies it
    /// directly.
    ThreeTap,
    /// The stored kernel has a single temporal tap; it is replicated to 3
    /// taps and divided by 3 before masking.
    SingleTap,
}

/// Primitive node kinds the assembler composes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// The graph's external input (a `[N, C, T, H, W]` clip tensor).
    Input,
    Conv3d(Conv3dSpec),
    /// Parameter-only node producing the soft temporal mask from its learned
    /// logits (`{name}.mask`, shape `[channels, 1, 3, 1, 1]`).
    KernelMask {
        channels: usize,
        temperature: Temperature,
        init: MaskInit,
    },
    /// Temporal-branch convolution taking `[data, mask]` inputs. Regardless
    /// of the stored kernel variant, the executed kernel spans 3 temporal
    /// taps with temporal padding 1.
    MaskedConv3d {
        spec: Conv3dSpec,
        variant: MaskVariant,
    },
    BatchNorm3d { num_features: usize },
    Relu,
    MaxPool3d {
        kernel: [usize; 3],
        stride: [usize; 3],
        padding: [usize; 3],
    },
    GlobalAvgPool,
    /// Collapses everything after the batch axis into one dimension.
    Flatten,
    Linear {
        in_features: usize,
        out_features: usize,
    },
    /// Channel-axis concatenation of its inputs, in input order.
    Concat,
    /// Elementwise sum of its two inputs (residual join).
    Add,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Hierarchical module path, used to derive parameter names.
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
}

/// A network as a topologically ordered node list. The last node added is
/// the graph output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    /// Appends a node. Inputs must refer to already-added nodes, which keeps
    /// the node list a valid evaluation order by construction.
    pub fn add(&mut self, name: impl Into<String>, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug_assert!(inputs.iter().all(|i| i.0 < id.0));
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind,
            inputs,
        });
        id
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The graph output (last node added).
    pub fn output(&self) -> Option<NodeId> {
        self.nodes.last().map(|n| n.id)
    }

    /// Parameter name -> expected shape for every learnable tensor and
    /// buffer in the graph. This is the adapter's target map.
    pub fn parameter_shapes(&self) -> ShapeMap {
        let mut shapes = ShapeMap::new();
        for node in &self.nodes {
            let name = &node.name;
            match &node.kind {
                NodeKind::Conv3d(spec) | NodeKind::MaskedConv3d { spec, .. } => {
                    shapes.insert(format!("{name}.weight"), spec.weight_shape().to_vec());
                    if spec.bias {
                        shapes.insert(format!("{name}.bias"), vec![spec.out_channels]);
                    }
                }
                NodeKind::KernelMask { channels, .. } => {
                    shapes.insert(format!("{name}.mask"), logit_shape(*channels).to_vec());
                }
                NodeKind::BatchNorm3d { num_features } => {
                    for suffix in ["weight", "bias", "running_mean", "running_var"] {
                        shapes.insert(format!("{name}.{suffix}"), vec![*num_features]);
                    }
                }
                NodeKind::Linear {
                    in_features,
                    out_features,
                } => {
                    shapes.insert(format!("{name}.weight"), vec![*out_features, *in_features]);
                    shapes.insert(format!("{name}.bias"), vec![*out_features]);
                }
                _ => {}
            }
        }
        shapes
    }

    /// Freshly initialized state for every parameter in the graph:
    /// Kaiming-normal (fan-out, relu gain) convolution weights, unit-scale /
    /// zero-shift batch norm with zero mean and unit variance buffers,
    /// uniform fan-in linear layers, and mask logits per their configured
    /// policy.
    pub fn init_state<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<StateDict, ConfigError> {
        let mut state = StateDict::new();
        for node in &self.nodes {
            let name = &node.name;
            match &node.kind {
                NodeKind::Conv3d(spec) | NodeKind::MaskedConv3d { spec, .. } => {
                    let shape = spec.weight_shape();
                    let fan_out = spec.out_channels * spec.kernel.iter().product::<usize>();
                    let std = (2.0 / fan_out as TensorData).sqrt();
                    state.insert(format!("{name}.weight"), normal_init(&shape, std, rng));
                    if spec.bias {
                        state.insert(
                            format!("{name}.bias"),
                            ArrayD::zeros(IxDyn(&[spec.out_channels])),
                        );
                    }
                }
                NodeKind::KernelMask { channels, init, .. } => {
                    let shape = logit_shape(*channels);
                    let logits = match init {
                        MaskInit::Zeros => ArrayD::zeros(IxDyn(&shape)),
                        MaskInit::Ones => ArrayD::ones(IxDyn(&shape)),
                        MaskInit::Normal { std } => {
                            if !std.is_finite() || *std <= 0.0 {
                                return Err(ConfigError::InvalidMaskStd(*std));
                            }
                            normal_init(&shape, *std, rng)
                        }
                    };
                    state.insert(format!("{name}.mask"), logits);
                }
                NodeKind::BatchNorm3d { num_features } => {
                    let c = IxDyn(&[*num_features]);
                    state.insert(format!("{name}.weight"), ArrayD::ones(c.clone()));
                    state.insert(format!("{name}.bias"), ArrayD::zeros(c.clone()));
                    state.insert(format!("{name}.running_mean"), ArrayD::zeros(c.clone()));
                    state.insert(format!("{name}.running_var"), ArrayD::ones(c));
                }
                NodeKind::Linear {
                    in_features,
                    out_features,
                } => {
                    let bound = 1.0 / (*in_features as TensorData).sqrt();
                    let dist = Uniform::new(-bound, bound);
                    state.insert(
                        format!("{name}.weight"),
                        ArrayD::random_using(IxDyn(&[*out_features, *in_features]), dist, rng),
                    );
                    state.insert(
                        format!("{name}.bias"),
                        ArrayD::random_using(IxDyn(&[*out_features]), dist, rng),
                    );
                }
                _ => {}
            }
        }
        Ok(state)
    }
}

fn normal_init<R: Rng + ?Sized>(
    shape: &[usize],
    std: TensorData,
    rng: &mut R,
) -> ArrayD<TensorData> {
    // std is derived from fan-out (or validated by the caller), so the
    // distribution construction cannot fail.
    let dist = Normal::new(0.0, std).unwrap_or_else(|_| {
        unreachable!("normal distribution with positive finite std")
    });
    ArrayD::random_using(IxDyn(shape), dist, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn spec(cin: usize, cout: usize, kernel: [usize; 3]) -> Conv3dSpec {
        Conv3dSpec {
            in_channels: cin,
            out_channels: cout,
            kernel,
            stride: [1, 1, 1],
            padding: [0, 0, 0],
            bias: false,
        }
    }

    #[test]
    fn parameter_shapes_cover_all_node_kinds() {
        let mut g = Graph::new();
        let x = g.add("input", NodeKind::Input, vec![]);
        let c = g.add("conv1", NodeKind::Conv3d(spec(3, 64, [1, 7, 7])), vec![x]);
        let b = g.add(
            "bn1",
            NodeKind::BatchNorm3d { num_features: 64 },
            vec![c],
        );
        let km = g.add(
            "layer1.0.km",
            NodeKind::KernelMask {
                channels: 32,
                temperature: Temperature::default(),
                init: MaskInit::Zeros,
            },
            vec![],
        );
        let mc = g.add(
            "layer1.0.conv1_t",
            NodeKind::MaskedConv3d {
                spec: spec(64, 32, [1, 1, 1]),
                variant: MaskVariant::SingleTap,
            },
            vec![b, km],
        );
        g.add(
            "fc",
            NodeKind::Linear {
                in_features: 2048,
                out_features: 1000,
            },
            vec![mc],
        );

        let shapes = g.parameter_shapes();
        assert_eq!(shapes["conv1.weight"], vec![64, 3, 1, 7, 7]);
        assert_eq!(shapes["bn1.running_var"], vec![64]);
        assert_eq!(shapes["layer1.0.km.mask"], vec![32, 1, 3, 1, 1]);
        assert_eq!(shapes["layer1.0.conv1_t.weight"], vec![32, 64, 1, 1, 1]);
        assert_eq!(shapes["fc.weight"], vec![1000, 2048]);
        assert_eq!(shapes["fc.bias"], vec![1000]);
        assert!(!shapes.contains_key("input.weight"));
    }

    #[test]
    fn init_state_matches_declared_shapes() {
        let mut g = Graph::new();
        let x = g.add("input", NodeKind::Input, vec![]);
        g.add("conv1", NodeKind::Conv3d(spec(3, 16, [3, 3, 3])), vec![x]);
        g.add("bn1", NodeKind::BatchNorm3d { num_features: 16 }, vec![x]);

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let state = g.init_state(&mut rng).unwrap();
        let shapes = g.parameter_shapes();
        assert_eq!(state.len(), shapes.len());
        for (key, shape) in &shapes {
            assert_eq!(state[key].shape(), shape.as_slice(), "{key}");
        }
        assert!(state["bn1.weight"].iter().all(|&v| v == 1.0));
        assert!(state["bn1.running_mean"].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn init_state_rejects_bad_mask_std() {
        let mut g = Graph::new();
        g.add(
            "km",
            NodeKind::KernelMask {
                channels: 4,
                temperature: Temperature::default(),
                init: MaskInit::Normal { std: -0.01 },
            },
            vec![],
        );
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        assert!(g.init_state(&mut rng).is_err());
    }
}
