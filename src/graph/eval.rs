//! # Graph Evaluation
//!
//! A pure routine that walks a [`Graph`](super::Graph) in node order,
//! resolving parameters from a [`StateDict`]. Heavy kernels (convolution,
//! batch norm, pooling, linear) are delegated to a caller-supplied
//! [`Backend`]; mask computation, mask application, concatenation, the
//! residual add, and flattening are handled in-crate since they are plain
//! tensor bookkeeping.

use crate::mask::{self, MaskError, TEMPORAL_TAPS};
use crate::state::{StateDict, TensorData};
use super::{Graph, MaskVariant, Node, NodeKind};
use ndarray::{concatenate, ArrayD, Axis, IxDyn};

/// Epsilon applied inside batch normalization.
pub const BATCH_NORM_EPS: TensorData = 1e-5;

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("parameter '{0}' missing from state dict")]
    MissingParameter(String),
    #[error("node '{name}' expects {expected} inputs, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("node '{name}': incompatible operand shapes {left:?} and {right:?}")]
    ShapeMismatch {
        name: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error("backend failure in '{node}': {message}")]
    Backend { node: String, message: String },
    #[error("graph is empty")]
    EmptyGraph,
}

/// The tensor-computation collaborator executing the heavy kernels. This
/// crate defines the interface only; CPU/GPU implementations live outside.
pub trait Backend {
    fn conv3d(
        &self,
        input: &ArrayD<TensorData>,
        weight: &ArrayD<TensorData>,
        bias: Option<&ArrayD<TensorData>>,
        stride: [usize; 3],
        padding: [usize; 3],
    ) -> Result<ArrayD<TensorData>, EvalError>;

    #[allow(clippy::too_many_arguments)]
    fn batch_norm3d(
        &self,
        input: &ArrayD<TensorData>,
        weight: &ArrayD<TensorData>,
        bias: &ArrayD<TensorData>,
        running_mean: &ArrayD<TensorData>,
        running_var: &ArrayD<TensorData>,
        eps: TensorData,
    ) -> Result<ArrayD<TensorData>, EvalError>;

    fn relu(&self, input: &ArrayD<TensorData>) -> Result<ArrayD<TensorData>, EvalError>;

    fn max_pool3d(
        &self,
        input: &ArrayD<TensorData>,
        kernel: [usize; 3],
        stride: [usize; 3],
        padding: [usize; 3],
    ) -> Result<ArrayD<TensorData>, EvalError>;

    /// Collapses the `[T, H, W]` extent to `[1, 1, 1]` by averaging.
    fn global_avg_pool3d(
        &self,
        input: &ArrayD<TensorData>,
    ) -> Result<ArrayD<TensorData>, EvalError>;

    fn linear(
        &self,
        input: &ArrayD<TensorData>,
        weight: &ArrayD<TensorData>,
        bias: &ArrayD<TensorData>,
    ) -> Result<ArrayD<TensorData>, EvalError>;
}

fn param<'a>(state: &'a StateDict, name: &str) -> Result<&'a ArrayD<TensorData>, EvalError> {
    state
        .get(name)
        .ok_or_else(|| EvalError::MissingParameter(name.to_string()))
}

fn arity(node: &Node, expected: usize) -> Result<(), EvalError> {
    if node.inputs.len() != expected {
        return Err(EvalError::Arity {
            name: node.name.clone(),
            expected,
            got: node.inputs.len(),
        });
    }
    Ok(())
}

// Inputs precede their consumers in node order, so their values are always
// set by the time a consumer runs.
fn value_of<'a>(values: &'a [Option<ArrayD<TensorData>>], id: super::NodeId) -> &'a ArrayD<TensorData> {
    values[id.0].as_ref().expect("topological order violated")
}

fn unary<'a>(
    values: &'a [Option<ArrayD<TensorData>>],
    node: &Node,
) -> Result<&'a ArrayD<TensorData>, EvalError> {
    arity(node, 1)?;
    Ok(value_of(values, node.inputs[0]))
}

fn binary<'a>(
    values: &'a [Option<ArrayD<TensorData>>],
    node: &Node,
) -> Result<(&'a ArrayD<TensorData>, &'a ArrayD<TensorData>), EvalError> {
    arity(node, 2)?;
    Ok((value_of(values, node.inputs[0]), value_of(values, node.inputs[1])))
}

/// Evaluates `graph` on `input` with parameters from `state`, returning the
/// output node's value.
pub fn evaluate<B: Backend>(
    graph: &Graph,
    state: &StateDict,
    backend: &B,
    input: &ArrayD<TensorData>,
) -> Result<ArrayD<TensorData>, EvalError> {
    let mut values: Vec<Option<ArrayD<TensorData>>> = vec![None; graph.nodes().len()];

    for node in graph.nodes() {
        let name = &node.name;
        let value = match &node.kind {
            NodeKind::Input => input.clone(),
            NodeKind::Conv3d(spec) => {
                let x = unary(&values, node)?;
                let weight = param(state, &format!("{name}.weight"))?;
                let bias = if spec.bias {
                    Some(param(state, &format!("{name}.bias"))?)
                } else {
                    None
                };
                backend.conv3d(x, weight, bias, spec.stride, spec.padding)?
            }
            NodeKind::KernelMask { temperature, .. } => {
                let soft = mask::kernel_mask(param(state, &format!("{name}.mask"))?, *temperature)?;
                log::debug!("kernel mask '{name}': first channel {:?}", first_channel(&soft));
                soft
            }
            NodeKind::MaskedConv3d { spec, variant } => {
                let (x, soft_mask) = binary(&values, node)?;
                let weight = param(state, &format!("{name}.weight"))?;
                let masked = match variant {
                    MaskVariant::ThreeTap => mask::apply_v1(soft_mask, weight)?,
                    MaskVariant::SingleTap => mask::apply_v2(soft_mask, weight)?,
                };
                // The executed kernel always spans 3 temporal taps with
                // temporal padding 1, whatever the stored variant.
                let mut padding = spec.padding;
                padding[0] = (TEMPORAL_TAPS - 1) / 2;
                backend.conv3d(x, &masked, None, spec.stride, padding)?
            }
            NodeKind::BatchNorm3d { .. } => {
                let x = unary(&values, node)?;
                backend.batch_norm3d(
                    x,
                    param(state, &format!("{name}.weight"))?,
                    param(state, &format!("{name}.bias"))?,
                    param(state, &format!("{name}.running_mean"))?,
                    param(state, &format!("{name}.running_var"))?,
                    BATCH_NORM_EPS,
                )?
            }
            NodeKind::Relu => backend.relu(unary(&values, node)?)?,
            NodeKind::MaxPool3d {
                kernel,
                stride,
                padding,
            } => backend.max_pool3d(unary(&values, node)?, *kernel, *stride, *padding)?,
            NodeKind::GlobalAvgPool => backend.global_avg_pool3d(unary(&values, node)?)?,
            NodeKind::Flatten => {
                let x = unary(&values, node)?;
                let batch = x.shape().first().copied().unwrap_or(0);
                let rest: usize = x.shape().iter().skip(1).product();
                x.clone()
                    .into_shape(IxDyn(&[batch, rest]))
                    .map_err(|_| EvalError::ShapeMismatch {
                        name: name.clone(),
                        left: x.shape().to_vec(),
                        right: vec![batch, rest],
                    })?
            }
            NodeKind::Linear { .. } => {
                let x = unary(&values, node)?;
                backend.linear(
                    x,
                    param(state, &format!("{name}.weight"))?,
                    param(state, &format!("{name}.bias"))?,
                )?
            }
            NodeKind::Concat => {
                let parts: Vec<_> = node.inputs.iter().map(|i| value_of(&values, *i)).collect();
                let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
                concatenate(Axis(1), &views).map_err(|_| EvalError::ShapeMismatch {
                    name: name.clone(),
                    left: parts.first().map(|p| p.shape().to_vec()).unwrap_or_default(),
                    right: parts.last().map(|p| p.shape().to_vec()).unwrap_or_default(),
                })?
            }
            NodeKind::Add => {
                let (a, b) = binary(&values, node)?;
                if a.shape() != b.shape() {
                    return Err(EvalError::ShapeMismatch {
                        name: name.clone(),
                        left: a.shape().to_vec(),
                        right: b.shape().to_vec(),
                    });
                }
                a + b
            }
        };
        values[node.id.0] = Some(value);
    }

    let output = graph.output().ok_or(EvalError::EmptyGraph)?;
    Ok(values[output.0].take().expect("output node evaluated"))
}

fn first_channel(mask: &ArrayD<TensorData>) -> Vec<TensorData> {
    (0..TEMPORAL_TAPS)
        .map(|t| mask[IxDyn(&[0, 0, t, 0, 0])])
        .collect()
}
