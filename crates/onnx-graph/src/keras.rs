use std::sync::Arc;
use crate::{operators, Error};
use crate::operators::{Cast, Clip, Constant, Padding, Reshape, Transpose};
use crate::tensor::{DType, Shape, Tensor, TensorData};
use crate::weights::WeightManager;

fn scoped(weight_manager: &impl WeightManager, op: &str) -> Option<String> {
    weight_manager.get_prefix().map(|prefix| format!("{}/{}", prefix, op))
}

pub fn scalar(dtype: DType, value: f64) -> Result<Arc<dyn Tensor>, Error> {
    Ok(Constant::new(None, TensorData::fill_f64(Shape::scalar(), dtype, value)?))
}

pub fn int64_vector(values: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    let shape = Shape::from(&[values.len()][..]);
    Ok(Constant::new(None, TensorData::new(values.into(), shape)?))
}

pub fn reshape(name: Option<String>, input: Arc<dyn Tensor>, dims: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(Reshape::new(name, input, int64_vector(dims)?)?)
}

pub fn transpose(name: Option<String>, input: Arc<dyn Tensor>, perm: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    if perm.iter().enumerate().all(|(i, p)| *p == i as i64) {
        return Ok(input);
    }
    Ok(Transpose::new(name, input, Some(perm))?)
}

pub fn cast(name: Option<String>, input: Arc<dyn Tensor>, dtype: DType) -> Arc<dyn Tensor> {
    if input.dtype() != dtype {
        Cast::new(name, input, dtype)
    } else {
        input
    }
}

/// Permutation taking a channels-last tensor to channels-first.
pub fn to_channels_first_perm(rank: usize) -> Vec<i64> {
    let mut perm = vec![0, rank as i64 - 1];
    perm.extend(1..rank as i64 - 1);
    perm
}

/// Permutation taking a channels-first tensor back to channels-last.
pub fn to_channels_last_perm(rank: usize) -> Vec<i64> {
    let mut perm = vec![0];
    perm.extend(2..rank as i64);
    perm.push(1);
    perm
}

/// Maps a channels-last axis to where it lives once the tensor is channels-first.
pub fn channels_first_axis(axis: usize, rank: usize) -> usize {
    if axis == 0 {
        0
    } else if axis == rank - 1 {
        1
    } else {
        axis + 1
    }
}

/// Keras dense layer: `kernel` is `(in, out)`, applied to the last axis.
pub fn dense(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, use_bias: bool) -> Result<Arc<dyn Tensor>, Error> {
    let kernel = weight_manager.get_tensor("kernel")?;
    let bias = if use_bias { Some(weight_manager.get_tensor("bias")?) } else { None };
    if input.rank() == 2 {
        return Ok(operators::Gemm::new(scoped(weight_manager, "Gemm"), input, kernel, bias, false, false, 1.0, 1.0)?);
    }
    let mat_out = operators::MatMul::new(scoped(weight_manager, "MatMul"), input, kernel)?;
    if let Some(bias) = bias {
        Ok(operators::Add::new(scoped(weight_manager, "BiasAdd"), mat_out, bias)?)
    } else {
        Ok(mat_out)
    }
}

/// Keras conv kernel `(k..., in, out)` to ONNX `(out, in, k...)`.
pub fn conv_kernel(kernel: &TensorData) -> Result<TensorData, Error> {
    let rank = kernel.shape().rank();
    if rank < 3 {
        return Err(Error::InputShapeError(format!("conv kernel {} has no spatial axes", kernel.shape())));
    }
    let mut perm = vec![rank - 1, rank - 2];
    perm.extend(0..rank - 2);
    kernel.permute(&perm)
}

/// Keras depthwise kernel `(k..., channels, multiplier)` to a grouped ONNX kernel
/// `(channels * multiplier, 1, k...)`.
pub fn depthwise_kernel(kernel: &TensorData) -> Result<TensorData, Error> {
    let rank = kernel.shape().rank();
    if rank < 3 {
        return Err(Error::InputShapeError(format!("depthwise kernel {} has no spatial axes", kernel.shape())));
    }
    let mut perm = vec![rank - 2, rank - 1];
    perm.extend(0..rank - 2);
    let permuted = kernel.permute(&perm)?;
    let dims = permuted.shape().resolve()?;
    let mut new_dims = vec![dims[0] * dims[1], 1];
    new_dims.extend_from_slice(&dims[2..]);
    permuted.reshape(Shape::from(new_dims))
}

/// Keras "same" padding. Uses TensorFlow's split (extra cell at the end) when the spatial size
/// is known, otherwise defers to `SAME_UPPER`.
pub fn same_padding(spatial: &[Option<usize>], kernel: &[usize], strides: &[usize], dilations: &[usize]) -> Padding {
    let mut begins = vec![];
    let mut ends = vec![];
    for (i, size) in spatial.iter().enumerate() {
        let Some(size) = size else {
            return Padding::SameUpper;
        };
        // zero strides or sizes are rejected by the layer; clamp so they cannot panic here
        let stride = strides[i].max(1);
        let extent = dilations[i] * kernel[i].saturating_sub(1) + 1;
        let out = size.div_ceil(stride);
        let total = (out.saturating_sub(1) * stride + extent).saturating_sub(*size) as i64;
        begins.push(total / 2);
        ends.push(total - total / 2);
    }
    begins.extend(ends);
    Padding::Explicit(begins)
}

/// Keras activation functions, by their serialized names.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Sigmoid,
    HardSigmoid { alpha: f32, beta: f32 },
    Tanh,
    Softmax,
    Softplus,
    Softsign,
    Elu,
    Selu,
    Swish,
    Gelu,
    Exponential,
    LeakyRelu { alpha: f32 },
    Mish,
}

impl Activation {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        Ok(match name {
            "linear" => Activation::Linear,
            "relu" => Activation::Relu,
            "relu6" => Activation::Relu6,
            "sigmoid" => Activation::Sigmoid,
            "hard_sigmoid" => Activation::HardSigmoid { alpha: 1.0 / 6.0, beta: 0.5 },
            "tanh" => Activation::Tanh,
            "softmax" => Activation::Softmax,
            "softplus" => Activation::Softplus,
            "softsign" => Activation::Softsign,
            "elu" => Activation::Elu,
            "selu" => Activation::Selu,
            "swish" | "silu" => Activation::Swish,
            "gelu" => Activation::Gelu,
            "exponential" => Activation::Exponential,
            "leaky_relu" => Activation::LeakyRelu { alpha: 0.2 },
            "mish" => Activation::Mish,
            other => return Err(Error::UnsupportedActivationError(other.to_string())),
        })
    }
}

/// Lowers `activation` onto `input`; `Linear` returns the input untouched.
pub fn activation(prefix: &str, input: Arc<dyn Tensor>, activation: Activation) -> Result<Arc<dyn Tensor>, Error> {
    let name = |op: &str| Some(format!("{}/{}", prefix, op));
    let dtype = input.dtype();
    let output: Arc<dyn Tensor> = match activation {
        Activation::Linear => input,
        Activation::Relu => operators::Relu::new(name("Relu"), input),
        Activation::Relu6 => Clip::new(name("Relu6"), input, Some(scalar(dtype, 0.0)?), Some(scalar(dtype, 6.0)?))?,
        Activation::Sigmoid => operators::Sigmoid::new(name("Sigmoid"), input),
        Activation::HardSigmoid { alpha, beta } => operators::HardSigmoid::new(name("HardSigmoid"), input, alpha, beta),
        Activation::Tanh => operators::Tanh::new(name("Tanh"), input),
        Activation::Softmax => operators::Softmax::new(name("Softmax"), input, -1)?,
        Activation::Softplus => operators::Softplus::new(name("Softplus"), input),
        Activation::Softsign => operators::Softsign::new(name("Softsign"), input),
        Activation::Elu => operators::Elu::new(name("Elu"), input, 1.0),
        Activation::Selu => operators::Selu::new(name("Selu"), input),
        Activation::Swish => {
            let gate = operators::Sigmoid::new(name("Sigmoid"), input.clone());
            operators::Mul::new(name("Swish"), input, gate)?
        }
        Activation::Gelu => {
            // 0.5 * x * (1 + erf(x / sqrt(2)))
            let scaled = operators::Div::new(name("Gelu/Div"), input.clone(), scalar(dtype, std::f64::consts::SQRT_2)?)?;
            let erf = operators::Erf::new(name("Gelu/Erf"), scaled);
            let shifted = operators::Add::new(name("Gelu/Add"), erf, scalar(dtype, 1.0)?)?;
            let gated = operators::Mul::new(name("Gelu/Mul"), input, shifted)?;
            operators::Mul::new(name("Gelu"), gated, scalar(dtype, 0.5)?)?
        }
        Activation::Exponential => operators::Exp::new(name("Exp"), input),
        Activation::LeakyRelu { alpha } => operators::LeakyRelu::new(name("LeakyRelu"), input, alpha),
        Activation::Mish => {
            let softplus = operators::Softplus::new(name("Mish/Softplus"), input.clone());
            let tanh = operators::Tanh::new(name("Mish/Tanh"), softplus);
            operators::Mul::new(name("Mish"), input, tanh)?
        }
    };
    Ok(output)
}

/// Keras `ReLU` layer with its optional cap, leak and threshold.
pub fn relu_layer(prefix: &str, input: Arc<dyn Tensor>, max_value: Option<f64>, negative_slope: f64, threshold: f64) -> Result<Arc<dyn Tensor>, Error> {
    if threshold != 0.0 {
        return Err(Error::UnsupportedActivationError(format!("relu with threshold {}", threshold)));
    }
    let dtype = input.dtype();
    let name = |op: &str| Some(format!("{}/{}", prefix, op));
    let rectified: Arc<dyn Tensor> = if negative_slope != 0.0 {
        operators::LeakyRelu::new(name("LeakyRelu"), input, negative_slope as f32)
    } else if let Some(max_value) = max_value {
        return Ok(Clip::new(name("Clip"), input, Some(scalar(dtype, 0.0)?), Some(scalar(dtype, max_value)?))?);
    } else {
        operators::Relu::new(name("Relu"), input)
    };
    match max_value {
        Some(max_value) => Ok(operators::Min::new(name("Min"), vec![rectified, scalar(dtype, max_value)?])?),
        None => Ok(rectified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorDataValue;

    #[test]
    fn conv_kernel_moves_filters_first() {
        // (kh=1, kw=1, in=2, out=3)
        let kernel = TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0].into(), Shape::from(vec![1usize, 1, 2, 3])).unwrap();
        let out = conv_kernel(&kernel).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![3, 2, 1, 1]);
        assert_eq!(out.value(), &TensorDataValue::F32(vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]));
    }

    #[test]
    fn depthwise_kernel_groups_channels() {
        // (kh=1, kw=2, channels=2, multiplier=1)
        let kernel = TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0].into(), Shape::from(vec![1usize, 2, 2, 1])).unwrap();
        let out = depthwise_kernel(&kernel).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![2, 1, 1, 2]);
        assert_eq!(out.value(), &TensorDataValue::F32(vec![0.0, 2.0, 1.0, 3.0]));
    }

    #[test]
    fn same_padding_matches_tensorflow() {
        let pads = same_padding(&[Some(224), Some(224)], &[3, 3], &[2, 2], &[1, 1]);
        assert_eq!(pads, Padding::Explicit(vec![0, 0, 1, 1]));
        let pads = same_padding(&[Some(5)], &[3], &[1], &[1]);
        assert_eq!(pads, Padding::Explicit(vec![1, 1]));
        assert_eq!(same_padding(&[None, Some(4)], &[3, 3], &[1, 1], &[1, 1]), Padding::SameUpper);
    }

    #[test]
    fn same_padding_tolerates_degenerate_windows() {
        assert_eq!(same_padding(&[Some(4)], &[3], &[0], &[1]), Padding::Explicit(vec![1, 1]));
        assert_eq!(same_padding(&[Some(0)], &[0], &[1], &[0]), Padding::Explicit(vec![0, 1]));
    }

    #[test]
    fn layout_permutations_invert() {
        assert_eq!(to_channels_first_perm(4), vec![0, 3, 1, 2]);
        assert_eq!(to_channels_last_perm(4), vec![0, 2, 3, 1]);
        assert_eq!(channels_first_axis(3, 4), 1);
        assert_eq!(channels_first_axis(1, 4), 2);
    }

    #[test]
    fn unknown_activation_is_rejected() {
        assert!(matches!(Activation::from_name("swish"), Ok(Activation::Swish)));
        assert!(matches!(Activation::from_name("crelu"), Err(Error::UnsupportedActivationError(_))));
    }
}
