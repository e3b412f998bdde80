use std::sync::Arc;
use serde_json::Value;
use strum_macros::{Display, EnumIter, EnumString};
use onnx_graph::keras::{self, Activation};
use onnx_graph::operators::{
    Add, BatchNormalization, Concat, Constant, Conv, Elu, Flatten, GlobalPool, LeakyRelu, Max, Mean, Min, Mul, PRelu, Pad, Padding,
    Pool, PoolKind, Softmax, Sub, Sum, WindowParams,
};
use onnx_graph::tensor::{Shape, Tensor, TensorData, TensorDataValue, WeightTensor};
use onnx_graph::weights::{InMemoryWeightManager, WeightManager};
use onnx_graph::DType;
use crate::keras::config::Params;
use crate::keras::convert::KerasTensor;
use crate::keras::signature::onnx_dtype;
use crate::ConversionError;

/// Keras layer classes with a lowering, by their serialized `class_name`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum LayerClass {
    InputLayer,
    Dense,
    #[strum(to_string = "Conv1D", serialize = "Convolution1D")]
    Conv1D,
    #[strum(to_string = "Conv2D", serialize = "Convolution2D")]
    Conv2D,
    #[strum(to_string = "Conv3D", serialize = "Convolution3D")]
    Conv3D,
    DepthwiseConv2D,
    #[strum(to_string = "SeparableConv2D", serialize = "SeparableConvolution2D")]
    SeparableConv2D,
    BatchNormalization,
    Activation,
    ReLU,
    LeakyReLU,
    PReLU,
    ELU,
    Softmax,
    #[strum(to_string = "MaxPooling1D", serialize = "MaxPool1D")]
    MaxPooling1D,
    #[strum(to_string = "MaxPooling2D", serialize = "MaxPool2D")]
    MaxPooling2D,
    #[strum(to_string = "MaxPooling3D", serialize = "MaxPool3D")]
    MaxPooling3D,
    #[strum(to_string = "AveragePooling1D", serialize = "AvgPool1D")]
    AveragePooling1D,
    #[strum(to_string = "AveragePooling2D", serialize = "AvgPool2D")]
    AveragePooling2D,
    #[strum(to_string = "AveragePooling3D", serialize = "AvgPool3D")]
    AveragePooling3D,
    #[strum(to_string = "GlobalMaxPooling1D", serialize = "GlobalMaxPool1D")]
    GlobalMaxPooling1D,
    #[strum(to_string = "GlobalMaxPooling2D", serialize = "GlobalMaxPool2D")]
    GlobalMaxPooling2D,
    #[strum(to_string = "GlobalMaxPooling3D", serialize = "GlobalMaxPool3D")]
    GlobalMaxPooling3D,
    #[strum(to_string = "GlobalAveragePooling1D", serialize = "GlobalAvgPool1D")]
    GlobalAveragePooling1D,
    #[strum(to_string = "GlobalAveragePooling2D", serialize = "GlobalAvgPool2D")]
    GlobalAveragePooling2D,
    #[strum(to_string = "GlobalAveragePooling3D", serialize = "GlobalAvgPool3D")]
    GlobalAveragePooling3D,
    ZeroPadding1D,
    ZeroPadding2D,
    ZeroPadding3D,
    Flatten,
    Reshape,
    Permute,
    Concatenate,
    Add,
    Subtract,
    Multiply,
    Average,
    Maximum,
    Minimum,
    Rescaling,
    Dropout,
    SpatialDropout1D,
    SpatialDropout2D,
    SpatialDropout3D,
    GaussianNoise,
    GaussianDropout,
    AlphaDropout,
    ActivityRegularization,
}

impl LayerClass {
    fn spatial_rank(self) -> usize {
        use LayerClass::*;
        match self {
            Conv1D | MaxPooling1D | AveragePooling1D | GlobalMaxPooling1D | GlobalAveragePooling1D | ZeroPadding1D => 1,
            Conv3D | MaxPooling3D | AveragePooling3D | GlobalMaxPooling3D | GlobalAveragePooling3D | ZeroPadding3D => 3,
            _ => 2,
        }
    }

    fn pool_kind(self) -> PoolKind {
        use LayerClass::*;
        match self {
            MaxPooling1D | MaxPooling2D | MaxPooling3D | GlobalMaxPooling1D | GlobalMaxPooling2D | GlobalMaxPooling3D => PoolKind::Max,
            _ => PoolKind::Average,
        }
    }
}

/// Everything a lowering needs to know about the layer being converted.
pub(crate) struct LayerContext<'a> {
    /// Prefix for the names of the nodes this layer emits.
    pub name: String,
    pub weights: InMemoryWeightManager,
    pub params: Params<'a>,
    pub keras3: bool,
}

impl LayerContext<'_> {
    fn op(&self, op: &str) -> Option<String> {
        Some(format!("{}/{}", self.name, op))
    }

    fn weight(&self, name: &str) -> Result<Arc<dyn Tensor>, ConversionError> {
        Ok(self.weights.get_tensor(name)?)
    }

    fn weight_data(&self, name: &str) -> Result<TensorData, ConversionError> {
        Ok(self.weights.get_tensor_data(name)?)
    }

    /// A weight rewritten into ONNX layout; it is emitted under the layer's name.
    fn initializer(&self, name: &str, data: TensorData) -> Arc<dyn Tensor> {
        WeightTensor::new(format!("{}/{}", self.name, name), data)
    }

    fn cast(&self, input: Arc<dyn Tensor>, dtype: DType) -> Arc<dyn Tensor> {
        keras::cast(self.op("Cast"), input, dtype)
    }

    fn activation(&self) -> Result<Activation, ConversionError> {
        let activation = Activation::from_name(self.params.activation()?)?;
        // Keras 2 used the piecewise approximation 0.2 * x + 0.5
        Ok(match activation {
            Activation::HardSigmoid { beta, .. } if !self.keras3 => Activation::HardSigmoid { alpha: 0.2, beta },
            other => other,
        })
    }
}

fn single(ctx: &LayerContext, mut inputs: Vec<KerasTensor>) -> Result<KerasTensor, ConversionError> {
    if inputs.len() != 1 {
        return Err(ctx.params.invalid(format!("expected one input, got {}", inputs.len())));
    }
    Ok(inputs.remove(0))
}

fn apply_activation(ctx: &LayerContext, x: KerasTensor, activation: Activation) -> Result<KerasTensor, ConversionError> {
    match activation {
        Activation::Linear => Ok(x),
        // softmax runs over the Keras channel axis
        Activation::Softmax => Ok(KerasTensor::new(&ctx.name, keras::activation(&ctx.name, x.keras()?, activation)?)),
        _ => Ok(x.map(&ctx.name, |t| keras::activation(&ctx.name, t, activation))?),
    }
}

/// The input of a spatial layer in channels-first layout, plus whether the layer declared
/// `data_format = channels_first` (in which case the Keras layout already is channels-first).
fn spatial_input(ctx: &LayerContext, x: &KerasTensor, spatial: usize) -> Result<(Arc<dyn Tensor>, bool), ConversionError> {
    if x.rank() != spatial + 2 {
        return Err(ctx.params.invalid(format!("expected a rank {} input, got rank {}", spatial + 2, x.rank())));
    }
    let channels_first = ctx.params.channels_first()?;
    let tensor = if channels_first { x.keras()? } else { x.channels_first()? };
    Ok((tensor, channels_first))
}

fn spatial_output(ctx: &LayerContext, tensor: Arc<dyn Tensor>, channels_first: bool) -> KerasTensor {
    if channels_first {
        KerasTensor::new(&ctx.name, tensor)
    } else {
        KerasTensor::from_channels_first(&ctx.name, tensor)
    }
}

fn spatial_dims(input: &dyn Tensor) -> Vec<Option<usize>> {
    input.shape().dims[2..].iter().map(|d| d.value).collect()
}

fn padding(ctx: &LayerContext, input: &dyn Tensor, kernel: &[usize], strides: &[usize], dilations: &[usize]) -> Result<Padding, ConversionError> {
    match ctx.params.get_str_or("padding", "valid")? {
        "valid" => Ok(Padding::Valid),
        "same" => Ok(keras::same_padding(&spatial_dims(input), kernel, strides, dilations)),
        "causal" if kernel.len() == 1 => Ok(Padding::Explicit(vec![(dilations[0] * kernel[0].saturating_sub(1)) as i64, 0])),
        other => Err(ctx.params.invalid(format!("unsupported padding {}", other))),
    }
}

fn window(ctx: &LayerContext, input: &dyn Tensor, kernel: Vec<usize>, strides: Vec<usize>, dilations: Vec<usize>) -> Result<WindowParams, ConversionError> {
    if kernel.contains(&0) {
        return Err(ctx.params.invalid("window sizes must be positive"));
    }
    if strides.contains(&0) {
        return Err(ctx.params.invalid(format!("strides must be positive, got {:?}", strides)));
    }
    if dilations.contains(&0) {
        return Err(ctx.params.invalid(format!("dilation rates must be positive, got {:?}", dilations)));
    }
    let padding = padding(ctx, input, &kernel, &strides, &dilations)?;
    Ok(WindowParams::new(kernel, strides, dilations, padding))
}

fn optional_bias(ctx: &LayerContext) -> Result<Option<Arc<dyn Tensor>>, ConversionError> {
    if ctx.params.get_bool_or("use_bias", true)? { Ok(Some(ctx.weight("bias")?)) } else { Ok(None) }
}

fn lower_dense(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let kernel = ctx.weight("kernel")?;
    let input = ctx.cast(x.keras()?, kernel.dtype());
    let output = keras::dense(&ctx.weights, input, ctx.params.get_bool_or("use_bias", true)?)?;
    apply_activation(ctx, KerasTensor::new(&ctx.name, output), ctx.activation()?)
}

fn lower_conv(ctx: &LayerContext, class: LayerClass, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let spatial = class.spatial_rank();
    let (input, channels_first) = spatial_input(ctx, &x, spatial)?;
    let kernel = ctx.weight_data("kernel")?;
    let input = ctx.cast(input, kernel.dtype());
    let params = window(
        ctx,
        input.as_ref(),
        ctx.params.get_tuple("kernel_size", spatial)?,
        ctx.params.get_tuple_or("strides", spatial, 1)?,
        ctx.params.get_tuple_or("dilation_rate", spatial, 1)?,
    )?;
    let groups = ctx.params.get_i64_or("groups", 1)?;
    if groups < 1 {
        return Err(ctx.params.invalid(format!("groups must be positive, got {}", groups)));
    }
    let weight = ctx.initializer("kernel", keras::conv_kernel(&kernel)?);
    let output = Conv::new(ctx.op("Conv"), input, weight, optional_bias(ctx)?, params, groups as usize)?;
    apply_activation(ctx, spatial_output(ctx, output, channels_first), ctx.activation()?)
}

fn depthwise(ctx: &LayerContext, input: Arc<dyn Tensor>, weight_name: &str, bias: Option<Arc<dyn Tensor>>) -> Result<Arc<dyn Tensor>, ConversionError> {
    let kernel = ctx.weight_data(weight_name)?;
    let input = ctx.cast(input, kernel.dtype());
    let channels = input.shape().dims[1].value.ok_or_else(|| ctx.params.invalid("depthwise convolution needs a known channel count"))?;
    let params = window(
        ctx,
        input.as_ref(),
        ctx.params.get_tuple("kernel_size", 2)?,
        ctx.params.get_tuple_or("strides", 2, 1)?,
        ctx.params.get_tuple_or("dilation_rate", 2, 1)?,
    )?;
    let weight = ctx.initializer(weight_name, keras::depthwise_kernel(&kernel)?);
    Ok(Conv::new(ctx.op("DepthwiseConv"), input, weight, bias, params, channels)?)
}

fn lower_depthwise_conv(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let (input, channels_first) = spatial_input(ctx, &x, 2)?;
    let output = depthwise(ctx, input, "depthwise_kernel", optional_bias(ctx)?)?;
    apply_activation(ctx, spatial_output(ctx, output, channels_first), ctx.activation()?)
}

fn lower_separable_conv(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let (input, channels_first) = spatial_input(ctx, &x, 2)?;
    let depthwise_output = depthwise(ctx, input, "depthwise_kernel", None)?;
    let pointwise = ctx.weight_data("pointwise_kernel")?;
    let weight = ctx.initializer("pointwise_kernel", keras::conv_kernel(&pointwise)?);
    let params = WindowParams::new(vec![1, 1], vec![1, 1], vec![1, 1], Padding::Valid);
    let output = Conv::new(ctx.op("PointwiseConv"), depthwise_output, weight, optional_bias(ctx)?, params, 1)?;
    apply_activation(ctx, spatial_output(ctx, output, channels_first), ctx.activation()?)
}

fn normalized_axis(ctx: &LayerContext, axis: i64, rank: usize) -> Result<usize, ConversionError> {
    let normalized = if axis < 0 { axis + rank as i64 } else { axis };
    if normalized < 0 || normalized >= rank as i64 {
        return Err(ctx.params.invalid(format!("axis {} out of range for rank {}", axis, rank)));
    }
    Ok(normalized as usize)
}

fn batch_norm_axis(ctx: &LayerContext, rank: usize) -> Result<usize, ConversionError> {
    let axis = match ctx.params.get("axis") {
        None => -1,
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| ctx.params.invalid("axis is not an integer"))?,
        // Keras 2 serializes the axis as a one-element list
        Some(Value::Array(items)) if items.len() == 1 => items[0].as_i64().ok_or_else(|| ctx.params.invalid("axis is not an integer"))?,
        Some(other) => return Err(ctx.params.invalid(format!("unsupported normalization axis {}", other))),
    };
    normalized_axis(ctx, axis, rank)
}

fn lower_batch_norm(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let rank = x.rank();
    let axis = batch_norm_axis(ctx, rank)?;
    let mean = ctx.weight("moving_mean")?;
    let variance = ctx.weight("moving_variance")?;
    let dtype = mean.dtype();
    let channels = mean.shape().clone();
    let scale: Arc<dyn Tensor> = if ctx.params.get_bool_or("scale", true)? {
        ctx.weight("gamma")?
    } else {
        Constant::new(ctx.op("gamma"), TensorData::fill_f64(channels.clone(), dtype, 1.0)?)
    };
    let bias: Arc<dyn Tensor> = if ctx.params.get_bool_or("center", true)? {
        ctx.weight("beta")?
    } else {
        Constant::new(ctx.op("beta"), TensorData::zeros(channels, dtype)?)
    };
    let epsilon = ctx.params.get_f64_or("epsilon", 1e-3)? as f32;
    let normalize = |input: Arc<dyn Tensor>| -> Result<Arc<dyn Tensor>, ConversionError> {
        let input = ctx.cast(input, dtype);
        Ok(BatchNormalization::new(ctx.op("BatchNormalization"), input, scale, bias, mean, variance, epsilon)?)
    };

    if rank >= 3 && axis == rank - 1 {
        return Ok(KerasTensor::from_channels_first(&ctx.name, normalize(x.channels_first()?)?));
    }
    if axis == 1 {
        return Ok(KerasTensor::new(&ctx.name, normalize(x.keras()?)?));
    }
    // move the normalized axis to 1 and back
    let mut perm = vec![0, axis as i64];
    perm.extend((1..rank as i64).filter(|a| *a != axis as i64));
    let mut inverse = vec![0i64; rank];
    for (i, p) in perm.iter().enumerate() {
        inverse[*p as usize] = i as i64;
    }
    let moved = keras::transpose(ctx.op("Transpose"), x.keras()?, perm)?;
    let output = keras::transpose(ctx.op("TransposeBack"), normalize(moved)?, inverse)?;
    Ok(KerasTensor::new(&ctx.name, output))
}

fn lower_relu(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let max_value = ctx.params.get_opt_f64("max_value")?;
    let negative_slope = ctx.params.get_f64_or("negative_slope", 0.0)?;
    let threshold = ctx.params.get_f64_or("threshold", 0.0)?;
    Ok(x.map(&ctx.name, |t| keras::relu_layer(&ctx.name, t, max_value, negative_slope, threshold))?)
}

fn lower_leaky_relu(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    // Keras 3 renamed `alpha` to `negative_slope`
    let alpha = match ctx.params.get_opt_f64("negative_slope")? {
        Some(slope) => slope,
        None => ctx.params.get_f64_or("alpha", 0.3)?,
    };
    Ok(x.map(&ctx.name, |t| Ok(LeakyRelu::new(ctx.op("LeakyRelu"), t, alpha as f32) as Arc<dyn Tensor>))?)
}

fn lower_prelu(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let slope = ctx.weight("alpha")?;
    let input = ctx.cast(x.keras()?, slope.dtype());
    Ok(KerasTensor::new(&ctx.name, PRelu::new(ctx.op("PRelu"), input, slope)?))
}

fn lower_elu(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let alpha = ctx.params.get_f64_or("alpha", 1.0)? as f32;
    Ok(x.map(&ctx.name, |t| Ok(Elu::new(ctx.op("Elu"), t, alpha) as Arc<dyn Tensor>))?)
}

fn lower_softmax(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let axis = match ctx.params.get("axis") {
        Some(Value::Array(items)) if items.len() == 1 => items[0].as_i64().ok_or_else(|| ctx.params.invalid("axis is not an integer"))?,
        _ => ctx.params.get_i64_or("axis", -1)?,
    };
    Ok(KerasTensor::new(&ctx.name, Softmax::new(ctx.op("Softmax"), x.keras()?, axis)?))
}

fn lower_pool(ctx: &LayerContext, class: LayerClass, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let spatial = class.spatial_rank();
    let (input, channels_first) = spatial_input(ctx, &x, spatial)?;
    let pool_size = ctx.params.get_tuple_or("pool_size", spatial, 2)?;
    let strides = match ctx.params.get("strides") {
        Some(_) => ctx.params.get_tuple("strides", spatial)?,
        None => pool_size.clone(),
    };
    let params = window(ctx, input.as_ref(), pool_size, strides, vec![1; spatial])?;
    let kind = class.pool_kind();
    let op = if kind == PoolKind::Max { "MaxPool" } else { "AveragePool" };
    let output = Pool::new(ctx.op(op), kind, input, params)?;
    Ok(spatial_output(ctx, output, channels_first))
}

fn lower_global_pool(ctx: &LayerContext, class: LayerClass, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let (input, channels_first) = spatial_input(ctx, &x, class.spatial_rank())?;
    let kind = class.pool_kind();
    let op = if kind == PoolKind::Max { "GlobalMaxPool" } else { "GlobalAveragePool" };
    let pooled = GlobalPool::new(ctx.op(op), kind, input)?;
    if ctx.params.get_bool_or("keepdims", false)? {
        return Ok(spatial_output(ctx, pooled, channels_first));
    }
    Ok(KerasTensor::new(&ctx.name, Flatten::new(ctx.op("Flatten"), pooled, 1)?))
}

/// `padding` as `(begin, end)` per spatial axis. A bare integer pads every side; a flat list
/// gives one symmetric amount per axis, except in 1-D where it is the `(begin, end)` pair.
fn zero_padding_amounts(ctx: &LayerContext, spatial: usize) -> Result<Vec<(i64, i64)>, ConversionError> {
    let bad = || ctx.params.invalid("padding must be an integer, a list of integers or a list of pairs");
    let int = |v: &Value| v.as_i64().filter(|x| *x >= 0).ok_or_else(bad);
    match ctx.params.get("padding") {
        None => Ok(vec![(1, 1); spatial]),
        Some(Value::Number(_)) => {
            let p = int(ctx.params.get_value("padding")?)?;
            Ok(vec![(p, p); spatial])
        }
        Some(Value::Array(items)) if spatial == 1 && items.len() == 2 && items.iter().all(Value::is_number) => {
            Ok(vec![(int(&items[0])?, int(&items[1])?)])
        }
        Some(Value::Array(items)) if items.len() == spatial => items
            .iter()
            .map(|item| match item {
                Value::Array(pair) if pair.len() == 2 => Ok((int(&pair[0])?, int(&pair[1])?)),
                other => int(other).map(|p| (p, p)),
            })
            .collect(),
        Some(_) => Err(bad()),
    }
}

fn lower_zero_padding(ctx: &LayerContext, class: LayerClass, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let spatial = class.spatial_rank();
    let amounts = zero_padding_amounts(ctx, spatial)?;
    let (input, channels_first) = spatial_input(ctx, &x, spatial)?;
    let mut pads = vec![0, 0];
    pads.extend(amounts.iter().map(|(begin, _)| *begin));
    pads.extend([0, 0]);
    pads.extend(amounts.iter().map(|(_, end)| *end));
    let output = Pad::new(ctx.op("Pad"), input, keras::int64_vector(pads)?)?;
    Ok(spatial_output(ctx, output, channels_first))
}

fn lower_flatten(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let rank = x.rank();
    let mut input = x.keras()?;
    // channels_first inputs are flattened in channels-last order
    if ctx.params.channels_first()? && rank >= 3 {
        input = keras::transpose(ctx.op("Transpose"), input, keras::to_channels_last_perm(rank))?;
    }
    Ok(KerasTensor::new(&ctx.name, Flatten::new(ctx.op("Flatten"), input, 1)?))
}

fn lower_reshape(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let target = ctx.params.get_i64_list("target_shape")?;
    if target.iter().filter(|d| **d == -1).count() > 1 || target.iter().any(|d| *d == 0 || *d < -1) {
        return Err(ctx.params.invalid(format!("bad target_shape {:?}", target)));
    }
    let mut dims = vec![0];
    dims.extend(target);
    Ok(KerasTensor::new(&ctx.name, keras::reshape(ctx.op("Reshape"), x.keras()?, dims)?))
}

fn lower_permute(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let dims = ctx.params.get_i64_list("dims")?;
    let mut sorted = dims.clone();
    sorted.sort();
    if sorted != (1..=dims.len() as i64).collect::<Vec<_>>() || dims.len() + 1 != x.rank() {
        return Err(ctx.params.invalid(format!("dims {:?} is not a permutation of the non-batch axes", dims)));
    }
    let mut perm = vec![0];
    perm.extend(dims);
    Ok(KerasTensor::new(&ctx.name, keras::transpose(ctx.op("Transpose"), x.keras()?, perm)?))
}

fn lower_concatenate(ctx: &LayerContext, inputs: Vec<KerasTensor>) -> Result<KerasTensor, ConversionError> {
    let Some(first) = inputs.first() else {
        return Err(ctx.params.invalid("nothing to concatenate"));
    };
    let rank = first.rank();
    if inputs.iter().any(|x| x.rank() != rank) {
        return Err(ctx.params.invalid("inputs differ in rank"));
    }
    let axis = normalized_axis(ctx, ctx.params.get_i64_or("axis", -1)?, rank)?;
    if rank >= 3 && axis == rank - 1 {
        let tensors = inputs.iter().map(KerasTensor::channels_first).collect::<Result<Vec<_>, _>>()?;
        return Ok(KerasTensor::from_channels_first(&ctx.name, Concat::new(ctx.op("Concat"), tensors, 1)?));
    }
    let tensors = inputs.iter().map(KerasTensor::keras).collect::<Result<Vec<_>, _>>()?;
    Ok(KerasTensor::new(&ctx.name, Concat::new(ctx.op("Concat"), tensors, axis as i64)?))
}

fn lower_merge(ctx: &LayerContext, class: LayerClass, inputs: Vec<KerasTensor>) -> Result<KerasTensor, ConversionError> {
    if inputs.len() < 2 {
        return Err(ctx.params.invalid(format!("{} needs at least two inputs, got {}", class, inputs.len())));
    }
    let rank = inputs[0].rank();
    // stay channels-first when every operand already is
    let channels_first = rank >= 3 && inputs.iter().all(|x| x.rank() == rank && x.has_channels_first());
    let tensors = if channels_first {
        inputs.iter().map(KerasTensor::channels_first).collect::<Result<Vec<_>, _>>()?
    } else {
        inputs.iter().map(KerasTensor::keras).collect::<Result<Vec<_>, _>>()?
    };
    let output: Arc<dyn Tensor> = match class {
        LayerClass::Add if tensors.len() == 2 => Add::new(ctx.op("Add"), tensors[0].clone(), tensors[1].clone())?,
        LayerClass::Add => Sum::new(ctx.op("Sum"), tensors)?,
        LayerClass::Subtract if tensors.len() == 2 => Sub::new(ctx.op("Sub"), tensors[0].clone(), tensors[1].clone())?,
        LayerClass::Subtract => return Err(ctx.params.invalid("Subtract takes exactly two inputs")),
        LayerClass::Multiply => {
            let mut iter = tensors.into_iter();
            let mut product = iter.next().ok_or_else(|| ctx.params.invalid("nothing to multiply"))?;
            for (i, tensor) in iter.enumerate() {
                let name = if i == 0 { ctx.op("Mul") } else { ctx.op(&format!("Mul_{}", i)) };
                product = Mul::new(name, product, tensor)?;
            }
            product
        }
        LayerClass::Average => Mean::new(ctx.op("Mean"), tensors)?,
        LayerClass::Maximum => Max::new(ctx.op("Max"), tensors)?,
        LayerClass::Minimum => Min::new(ctx.op("Min"), tensors)?,
        other => return Err(ctx.params.invalid(format!("{} is not a merge layer", other))),
    };
    if channels_first {
        Ok(KerasTensor::from_channels_first(&ctx.name, output))
    } else {
        Ok(KerasTensor::new(&ctx.name, output))
    }
}

fn float_constant(ctx: &LayerContext, name: &str, values: &[f64], dtype: DType) -> Result<Arc<dyn Tensor>, ConversionError> {
    let value = match dtype {
        DType::F32 => TensorDataValue::F32(values.iter().map(|v| *v as f32).collect()),
        DType::F64 => TensorDataValue::F64(values.to_vec()),
        DType::F16 => TensorDataValue::F16(values.iter().map(|v| half::f16::from_f64(*v)).collect()),
        DType::BF16 => TensorDataValue::BF16(values.iter().map(|v| half::bf16::from_f64(*v)).collect()),
        other => return Err(ctx.params.invalid(format!("rescaling to {} is not supported", other))),
    };
    let shape = if values.len() == 1 { Shape::scalar() } else { Shape::from(vec![values.len()]) };
    Ok(Constant::new(ctx.op(name), TensorData::new(value, shape)?))
}

/// `scale` / `offset`: a number or a per-channel list.
fn numbers(ctx: &LayerContext, key: &str, default: f64) -> Result<Vec<f64>, ConversionError> {
    let bad = || ctx.params.invalid(format!("{} must be a number or a list of numbers", key));
    match ctx.params.get(key) {
        None => Ok(vec![default]),
        Some(Value::Number(n)) => Ok(vec![n.as_f64().ok_or_else(bad)?]),
        Some(Value::Array(items)) if !items.is_empty() => items.iter().map(|v| v.as_f64().ok_or_else(bad)).collect(),
        Some(_) => Err(bad()),
    }
}

fn lower_rescaling(ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    let scale = numbers(ctx, "scale", 1.0)?;
    let offset = numbers(ctx, "offset", 0.0)?;
    let dtype = ctx.params.dtype().and_then(|name| onnx_dtype(&name)).filter(|d| d.is_float()).unwrap_or(DType::F32);
    let rescale = |input: Arc<dyn Tensor>| -> Result<Arc<dyn Tensor>, ConversionError> {
        let input = ctx.cast(input, dtype);
        let scaled: Arc<dyn Tensor> = Mul::new(ctx.op("Mul"), input, float_constant(ctx, "scale", &scale, dtype)?)?;
        if offset.iter().all(|v| *v == 0.0) {
            return Ok(scaled);
        }
        Ok(Add::new(ctx.op("Add"), scaled, float_constant(ctx, "offset", &offset, dtype)?)?)
    };
    if scale.len() > 1 || offset.len() > 1 {
        // per-channel values broadcast over the Keras channel axis
        return Ok(KerasTensor::new(&ctx.name, rescale(x.keras()?)?));
    }
    if x.rank() >= 3 && x.has_channels_first() {
        return Ok(KerasTensor::from_channels_first(&ctx.name, rescale(x.channels_first()?)?));
    }
    Ok(KerasTensor::new(&ctx.name, rescale(x.keras()?)?))
}

fn lower_single(class: LayerClass, ctx: &LayerContext, x: KerasTensor) -> Result<KerasTensor, ConversionError> {
    match class {
        LayerClass::Dense => lower_dense(ctx, x),
        LayerClass::Conv1D | LayerClass::Conv2D | LayerClass::Conv3D => lower_conv(ctx, class, x),
        LayerClass::DepthwiseConv2D => lower_depthwise_conv(ctx, x),
        LayerClass::SeparableConv2D => lower_separable_conv(ctx, x),
        LayerClass::BatchNormalization => lower_batch_norm(ctx, x),
        LayerClass::Activation => apply_activation(ctx, x, ctx.activation()?),
        LayerClass::ReLU => lower_relu(ctx, x),
        LayerClass::LeakyReLU => lower_leaky_relu(ctx, x),
        LayerClass::PReLU => lower_prelu(ctx, x),
        LayerClass::ELU => lower_elu(ctx, x),
        LayerClass::Softmax => lower_softmax(ctx, x),
        LayerClass::MaxPooling1D
        | LayerClass::MaxPooling2D
        | LayerClass::MaxPooling3D
        | LayerClass::AveragePooling1D
        | LayerClass::AveragePooling2D
        | LayerClass::AveragePooling3D => lower_pool(ctx, class, x),
        LayerClass::GlobalMaxPooling1D
        | LayerClass::GlobalMaxPooling2D
        | LayerClass::GlobalMaxPooling3D
        | LayerClass::GlobalAveragePooling1D
        | LayerClass::GlobalAveragePooling2D
        | LayerClass::GlobalAveragePooling3D => lower_global_pool(ctx, class, x),
        LayerClass::ZeroPadding1D | LayerClass::ZeroPadding2D | LayerClass::ZeroPadding3D => lower_zero_padding(ctx, class, x),
        LayerClass::Flatten => lower_flatten(ctx, x),
        LayerClass::Reshape => lower_reshape(ctx, x),
        LayerClass::Permute => lower_permute(ctx, x),
        LayerClass::Rescaling => lower_rescaling(ctx, x),
        // identities at inference time
        LayerClass::InputLayer
        | LayerClass::Dropout
        | LayerClass::SpatialDropout1D
        | LayerClass::SpatialDropout2D
        | LayerClass::SpatialDropout3D
        | LayerClass::GaussianNoise
        | LayerClass::GaussianDropout
        | LayerClass::AlphaDropout
        | LayerClass::ActivityRegularization => Ok(x),
        other => Err(ctx.params.invalid(format!("{} takes several inputs", other))),
    }
}

/// Lowers one call of a layer onto its input tensors.
pub(crate) fn lower(class: LayerClass, ctx: &LayerContext, inputs: Vec<KerasTensor>) -> Result<KerasTensor, ConversionError> {
    match class {
        LayerClass::Concatenate => lower_concatenate(ctx, inputs),
        LayerClass::Add | LayerClass::Subtract | LayerClass::Multiply | LayerClass::Average | LayerClass::Maximum | LayerClass::Minimum => {
            lower_merge(ctx, class, inputs)
        }
        _ => lower_single(class, ctx, single(ctx, inputs)?),
    }
}

/// Class names accepted by the converter, sorted.
pub fn supported_layers() -> Vec<String> {
    use strum::IntoEnumIterator;
    let mut names: Vec<String> = LayerClass::iter().map(|class| class.to_string()).collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use serde_json::json;
    use onnx_graph::tensor::InputTensor;
    use crate::keras::config::LayerConfig;

    fn layer(class_name: &str, config: Value) -> LayerConfig {
        LayerConfig { class_name: class_name.to_string(), name: "layer".to_string(), config, inbound_nodes: vec![] }
    }

    fn context<'a>(layer: &'a LayerConfig, weights: Vec<(&str, TensorData)>, keras3: bool) -> LayerContext<'a> {
        let manager = InMemoryWeightManager::new(weights.into_iter().map(|(k, v)| (k.to_string(), v)).collect());
        LayerContext { name: layer.name.clone(), weights: manager.prefix(&layer.name), params: layer.params(), keras3 }
    }

    fn input(shape: Vec<usize>) -> KerasTensor {
        KerasTensor::new("x", InputTensor::new("x".to_string(), DType::F32, Shape::from(shape)))
    }

    fn dims(tensor: &Arc<dyn Tensor>) -> Vec<usize> {
        tensor.shape().resolve().unwrap()
    }

    fn op_type(tensor: &Arc<dyn Tensor>) -> String {
        tensor.get_node().map(|n| n.get_onnx_type().to_string()).unwrap_or_default()
    }

    #[test]
    fn legacy_class_names_parse() {
        assert_eq!(LayerClass::from_str("Convolution2D").unwrap(), LayerClass::Conv2D);
        assert_eq!(LayerClass::from_str("GlobalAvgPool2D").unwrap(), LayerClass::GlobalAveragePooling2D);
        assert_eq!(LayerClass::Conv2D.to_string(), "Conv2D");
        assert!(LayerClass::from_str("LSTM").is_err());
        assert!(supported_layers().contains(&"DepthwiseConv2D".to_string()));
    }

    #[test]
    fn zero_padding_accepts_every_serialized_form() {
        let config = layer("ZeroPadding2D", json!({"padding": 2}));
        assert_eq!(zero_padding_amounts(&context(&config, vec![], false), 2).unwrap(), vec![(2, 2), (2, 2)]);
        let config = layer("ZeroPadding2D", json!({"padding": [1, 3]}));
        assert_eq!(zero_padding_amounts(&context(&config, vec![], false), 2).unwrap(), vec![(1, 1), (3, 3)]);
        let config = layer("ZeroPadding2D", json!({"padding": [[0, 1], [2, 3]]}));
        assert_eq!(zero_padding_amounts(&context(&config, vec![], false), 2).unwrap(), vec![(0, 1), (2, 3)]);
        let config = layer("ZeroPadding1D", json!({"padding": [1, 2]}));
        assert_eq!(zero_padding_amounts(&context(&config, vec![], false), 1).unwrap(), vec![(1, 2)]);
        let config = layer("ZeroPadding2D", json!({"padding": "wide"}));
        assert!(zero_padding_amounts(&context(&config, vec![], false), 2).is_err());
    }

    #[test]
    fn zero_padding_grows_spatial_axes() {
        let config = layer("ZeroPadding2D", json!({"padding": [[0, 1], [2, 3]]}));
        let ctx = context(&config, vec![], false);
        let out = lower(LayerClass::ZeroPadding2D, &ctx, vec![input(vec![1, 4, 4, 3])]).unwrap();
        assert_eq!(dims(&out.channels_first().unwrap()), vec![1, 3, 5, 9]);
        assert_eq!(dims(&out.keras().unwrap()), vec![1, 5, 9, 3]);
    }

    #[test]
    fn hard_sigmoid_slope_depends_on_keras_version() {
        let config = layer("Activation", json!({"activation": "hard_sigmoid"}));
        assert_eq!(context(&config, vec![], false).activation().unwrap(), Activation::HardSigmoid { alpha: 0.2, beta: 0.5 });
        assert_eq!(context(&config, vec![], true).activation().unwrap(), Activation::HardSigmoid { alpha: 1.0 / 6.0, beta: 0.5 });
    }

    #[test]
    fn causal_conv_pads_only_the_start() {
        let config = layer("Conv1D", json!({"filters": 2, "kernel_size": 3, "padding": "causal", "dilation_rate": 2, "use_bias": false}));
        let kernel = TensorData::new(vec![0.0f32; 12].into(), Shape::from(vec![3usize, 2, 2])).unwrap();
        let ctx = context(&config, vec![("layer/kernel", kernel)], false);
        let out = lower(LayerClass::Conv1D, &ctx, vec![input(vec![1, 10, 2])]).unwrap();
        assert_eq!(dims(&out.keras().unwrap()), vec![1, 10, 2]);
    }

    #[test]
    fn batch_norm_on_channels_last_runs_channels_first() {
        let config = layer("BatchNormalization", json!({"axis": [3], "epsilon": 0.001, "scale": false}));
        let ones = TensorData::new(vec![1.0f32; 3].into(), Shape::from(vec![3usize])).unwrap();
        let weights = vec![("layer/beta", ones.clone()), ("layer/moving_mean", ones.clone()), ("layer/moving_variance", ones)];
        let ctx = context(&config, weights, false);
        let out = lower(LayerClass::BatchNormalization, &ctx, vec![input(vec![1, 4, 4, 3])]).unwrap();
        assert!(out.has_channels_first());
        let normalized = out.channels_first().unwrap();
        assert_eq!(op_type(&normalized), "BatchNormalization");
        assert_eq!(dims(&normalized), vec![1, 3, 4, 4]);
    }

    #[test]
    fn merge_stays_channels_first_when_operands_are() {
        let a = input(vec![1, 4, 4, 3]);
        let b = input(vec![1, 4, 4, 3]);
        a.channels_first().unwrap();
        b.channels_first().unwrap();
        let config = layer("Add", json!({}));
        let out = lower(LayerClass::Add, &context(&config, vec![], false), vec![a, b]).unwrap();
        assert_eq!(op_type(&out.channels_first().unwrap()), "Add");

        let config = layer("Multiply", json!({}));
        let out = lower(LayerClass::Multiply, &context(&config, vec![], false), vec![input(vec![1, 2]), input(vec![1, 2]), input(vec![1, 2])]).unwrap();
        assert_eq!(op_type(&out.keras().unwrap()), "Mul");
    }

    #[test]
    fn subtract_rejects_three_inputs() {
        let config = layer("Subtract", json!({}));
        let inputs = vec![input(vec![1, 2]), input(vec![1, 2]), input(vec![1, 2])];
        assert!(matches!(lower(LayerClass::Subtract, &context(&config, vec![], false), inputs), Err(ConversionError::InvalidLayerConfig { .. })));
    }

    #[test]
    fn flatten_of_channels_first_data_reorders_first() {
        let config = layer("Flatten", json!({"data_format": "channels_first"}));
        let out = lower(LayerClass::Flatten, &context(&config, vec![], false), vec![input(vec![1, 3, 2, 2])]).unwrap();
        let flat = out.keras().unwrap();
        assert_eq!(dims(&flat), vec![1, 12]);
        let transposed = flat.get_node().unwrap().get_input_tensors()[0].get_node().map(|n| n.get_onnx_type().to_string());
        assert_eq!(transposed.as_deref(), Some("Transpose"));
    }

    #[test]
    fn reshape_keeps_the_batch_axis() {
        let config = layer("Reshape", json!({"target_shape": [2, -1]}));
        let out = lower(LayerClass::Reshape, &context(&config, vec![], false), vec![input(vec![5, 3, 4])]).unwrap();
        assert_eq!(dims(&out.keras().unwrap()), vec![5, 2, 6]);
        let config = layer("Reshape", json!({"target_shape": [-1, -1]}));
        assert!(lower(LayerClass::Reshape, &context(&config, vec![], false), vec![input(vec![5, 3, 4])]).is_err());
    }

    #[test]
    fn rescaling_casts_integer_inputs() {
        let config = layer("Rescaling", json!({"scale": 0.00392156862745098, "offset": 0.0}));
        let x = KerasTensor::new("x", InputTensor::new("x".to_string(), DType::U8, Shape::from(vec![1usize, 8, 8, 3])));
        let out = lower(LayerClass::Rescaling, &context(&config, vec![], false), vec![x]).unwrap();
        let scaled = out.keras().unwrap();
        assert_eq!(scaled.dtype(), DType::F32);
        assert_eq!(op_type(&scaled), "Mul");
    }

    #[test]
    fn pooling_strides_default_to_pool_size() {
        let config = layer("MaxPooling2D", json!({"pool_size": [2, 2], "padding": "valid"}));
        let out = lower(LayerClass::MaxPooling2D, &context(&config, vec![], false), vec![input(vec![1, 8, 6, 3])]).unwrap();
        assert_eq!(dims(&out.keras().unwrap()), vec![1, 4, 3, 3]);
    }

    #[test]
    fn zero_strides_and_dilations_are_rejected() {
        let config = layer("MaxPooling2D", json!({"pool_size": [2, 2], "strides": [0, 0], "padding": "same"}));
        let out = lower(LayerClass::MaxPooling2D, &context(&config, vec![], false), vec![input(vec![1, 8, 6, 3])]);
        assert!(matches!(out, Err(ConversionError::InvalidLayerConfig { .. })));

        let config = layer("Conv2D", json!({"filters": 2, "kernel_size": 3, "padding": "same", "dilation_rate": 0}));
        let kernel = TensorData::new(vec![0.0f32; 54].into(), Shape::from(vec![3usize, 3, 3, 2])).unwrap();
        let bias = TensorData::new(vec![0.0f32; 2].into(), Shape::from(vec![2usize])).unwrap();
        let ctx = context(&config, vec![("layer/kernel", kernel), ("layer/bias", bias)], false);
        let out = lower(LayerClass::Conv2D, &ctx, vec![input(vec![1, 8, 6, 3])]);
        assert!(matches!(out, Err(ConversionError::InvalidLayerConfig { .. })));
    }
}
