use std::collections::HashMap;
use std::sync::Arc;
use crate::{onnx, validate_elementwise_inputs, Error};
use crate::node::{attr_float, attr_int, attr_ints, attr_string, attr_tensor, Node, SingleOutputNode};
use crate::tensor::{is_permutation, DType, Dimension, Shape, Tensor, TensorData};

fn unknown_dim() -> Arc<Dimension> {
    Dimension::new(None, None, None)
}

macro_rules! unary_op {
    ($(#[$meta:meta])* $op:ident) => {
        $(#[$meta])*
        pub struct $op {
            name: Option<String>,
            input: Arc<dyn Tensor>
        }

        impl $op {
            pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
                Arc::new(Self { name, input })
            }
        }

        impl Node for $op {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self.input.as_ref()]
            }

            fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self]
            }

            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }

            fn get_onnx_type(&self) -> &str {
                stringify!($op)
            }
        }

        impl SingleOutputNode for $op {
            fn get_output_shape(&self) -> &Shape {
                self.input.shape()
            }

            fn get_output_dtype(&self) -> DType {
                self.input.dtype()
            }
        }
    };
}

unary_op!(Relu);
unary_op!(Sigmoid);
unary_op!(Tanh);
unary_op!(Softplus);
unary_op!(Softsign);
unary_op!(Exp);
unary_op!(Erf);
unary_op!(
    /// Selu with ONNX's default alpha and gamma, which are the constants Keras uses.
    Selu
);
unary_op!(Identity);

macro_rules! binary_op {
    ($op:ident) => {
        pub struct $op {
            name: Option<String>,
            a: Arc<dyn Tensor>,
            b: Arc<dyn Tensor>,
            output_shape: Shape
        }

        impl $op {
            pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
                let output_shape = validate_elementwise_inputs(&[a.clone(), b.clone()])?;
                Ok(Arc::new(Self { name, a, b, output_shape }))
            }
        }

        impl Node for $op {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self.a.as_ref(), self.b.as_ref()]
            }

            fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self]
            }

            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }

            fn get_onnx_type(&self) -> &str {
                stringify!($op)
            }
        }

        impl SingleOutputNode for $op {
            fn get_output_shape(&self) -> &Shape {
                &self.output_shape
            }

            fn get_output_dtype(&self) -> DType {
                self.a.dtype()
            }
        }
    };
}

binary_op!(Add);
binary_op!(Sub);
binary_op!(Mul);
binary_op!(Div);

macro_rules! variadic_op {
    ($op:ident) => {
        pub struct $op {
            name: Option<String>,
            inputs: Vec<Arc<dyn Tensor>>,
            output_shape: Shape
        }

        impl $op {
            pub fn new(name: Option<String>, inputs: Vec<Arc<dyn Tensor>>) -> Result<Arc<Self>, Error> {
                if inputs.is_empty() {
                    return Err(Error::InvalidInputError(format!("{} needs at least one input", stringify!($op))));
                }
                let output_shape = validate_elementwise_inputs(&inputs)?;
                Ok(Arc::new(Self { name, inputs, output_shape }))
            }
        }

        impl Node for $op {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                self.inputs.iter().map(|x| x.as_ref()).collect()
            }

            fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self]
            }

            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }

            fn get_onnx_type(&self) -> &str {
                stringify!($op)
            }
        }

        impl SingleOutputNode for $op {
            fn get_output_shape(&self) -> &Shape {
                &self.output_shape
            }

            fn get_output_dtype(&self) -> DType {
                self.inputs[0].dtype()
            }
        }
    };
}

variadic_op!(Sum);
variadic_op!(Mean);
variadic_op!(Max);
variadic_op!(Min);

pub struct LeakyRelu {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    alpha: f32
}

impl LeakyRelu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, alpha: f32) -> Arc<Self> {
        Arc::new(Self { name, input, alpha })
    }
}

impl Node for LeakyRelu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "LeakyRelu"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_float("alpha", self.alpha)]
    }
}

impl SingleOutputNode for LeakyRelu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Elu {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    alpha: f32
}

impl Elu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, alpha: f32) -> Arc<Self> {
        Arc::new(Self { name, input, alpha })
    }
}

impl Node for Elu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Elu"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_float("alpha", self.alpha)]
    }
}

impl SingleOutputNode for Elu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct HardSigmoid {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    alpha: f32,
    beta: f32
}

impl HardSigmoid {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, alpha: f32, beta: f32) -> Arc<Self> {
        Arc::new(Self { name, input, alpha, beta })
    }
}

impl Node for HardSigmoid {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "HardSigmoid"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_float("alpha", self.alpha), attr_float("beta", self.beta)]
    }
}

impl SingleOutputNode for HardSigmoid {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64
}

impl Softmax {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        let rank = input.rank() as i64;
        if axis < -rank || axis >= rank {
            return Err(Error::InvalidInputError(format!("softmax axis {} out of range for rank {}", axis, rank)));
        }
        Ok(Arc::new(Self { name, input, axis }))
    }
}

impl Node for Softmax {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Softmax"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
}

impl SingleOutputNode for Softmax {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct PRelu {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    slope: Arc<dyn Tensor>
}

impl PRelu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, slope: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if input.dtype() != slope.dtype() {
            return Err(Error::DTypeMismatchError(input.dtype(), slope.dtype()));
        }
        // slope must broadcast onto the input without growing it
        let broadcast = input.shape().broadcast(slope.shape())?;
        if broadcast.rank() != input.rank() {
            return Err(Error::InputShapeError(format!("PRelu slope {} does not fit input {}", slope.shape(), input.shape())));
        }
        Ok(Arc::new(Self { name, input, slope }))
    }
}

impl Node for PRelu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.slope.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "PRelu"
    }
}

impl SingleOutputNode for PRelu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Clip with optional bounds. A missing `min` is written as an empty input name.
pub struct Clip {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    min: Option<Arc<dyn Tensor>>,
    max: Option<Arc<dyn Tensor>>
}

impl Clip {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, min: Option<Arc<dyn Tensor>>, max: Option<Arc<dyn Tensor>>) -> Result<Arc<Self>, Error> {
        for bound in min.iter().chain(max.iter()) {
            if bound.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError(input.dtype(), bound.dtype()));
            }
            if bound.rank() != 0 {
                return Err(Error::InputShapeError(format!("Clip bounds must be scalars, got {}", bound.shape())));
            }
        }
        Ok(Arc::new(Self { name, input, min, max }))
    }
}

impl Node for Clip {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref()];
        inputs.extend(self.min.iter().map(|x| x.as_ref()));
        inputs.extend(self.max.iter().map(|x| x.as_ref()));
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Clip"
    }

    fn to_node_proto(&self, name: Option<String>, tensor_names: &HashMap<&dyn Tensor, String>) -> onnx::NodeProto {
        let mut input = vec![tensor_names[&self.input.as_ref()].clone()];
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => {
                input.push(tensor_names[&min.as_ref()].clone());
                input.push(tensor_names[&max.as_ref()].clone());
            }
            (Some(min), None) => input.push(tensor_names[&min.as_ref()].clone()),
            (None, Some(max)) => {
                input.push(String::new());
                input.push(tensor_names[&max.as_ref()].clone());
            }
            (None, None) => {}
        }
        onnx::NodeProto {
            name: name.unwrap_or_default(),
            input,
            output: vec![tensor_names[&(self as &dyn Tensor)].clone()],
            op_type: "Clip".to_string(),
            .. Default::default()
        }
    }
}

impl SingleOutputNode for Clip {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast {
            name,
            input,
            to
        })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Cast"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("to", onnx::tensor_proto::DataType::from(self.to) as i64)]
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_shape: Shape
}

impl MatMul {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            Err(Error::DTypeMismatchError(a.dtype(), b.dtype()))?
        }
        let a_shape = if a.rank() == 1 {
            a.shape().unsqueeze(0)
        } else {
            a.shape().clone()
        };
        let b_shape = if b.rank() == 1 {
            b.shape().unsqueeze(1)
        } else {
            b.shape().clone()
        };
        if a_shape.rank() < 2 || b_shape.rank() < 2 {
            Err(Error::InputShapeError("MatMul inputs must have rank >= 1".to_string()))?
        }

        let (k_a, k_b) = (a_shape.dim(-1), b_shape.dim(-2));
        if k_a.value.is_some() && k_b.value.is_some() && k_a.as_ref() != k_b.as_ref() {
            Err(Error::InputShapeError(format!("MatMul inner dims differ: {} vs {}", a_shape, b_shape)))?
        }

        // Batch dims broadcast like elementwise ops
        let a_batch = Shape::new(a_shape.dims[..a_shape.rank() - 2].to_vec());
        let b_batch = Shape::new(b_shape.dims[..b_shape.rank() - 2].to_vec());
        let mut output_dims = a_batch.broadcast(&b_batch)?.dims;
        if a.rank() != 1 {
            output_dims.push(a_shape.dim(-2).clone());
        }
        if b.rank() != 1 {
            output_dims.push(b_shape.dim(-1).clone());
        }

        Ok(Arc::new(MatMul {
            name,
            a,
            b,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for MatMul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "MatMul"
    }
}

impl SingleOutputNode for MatMul {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

pub struct Gemm {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    c: Option<Arc<dyn Tensor>>,
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
    beta: f32,
    output_shape: Shape
}

impl Gemm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>, c: Option<Arc<dyn Tensor>>, trans_a: bool, trans_b: bool, alpha: f32, beta: f32) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()))
        }
        if let Some(c) = &c {
            if c.dtype() != a.dtype() {
                return Err(Error::DTypeMismatchError(a.dtype(), c.dtype()))
            }
        }
        let a_shape = if trans_a {
            a.shape().transpose()
        } else {
            a.shape().clone()
        };
        let b_shape = if trans_b {
            b.shape().transpose()
        } else {
            b.shape().clone()
        };
        if a_shape.rank() != 2 || b_shape.rank() != 2 {
            return Err(Error::InputShapeError(format!("Gemm needs rank 2 inputs, got {} and {}", a_shape, b_shape)))
        }
        if a_shape[1].value.is_some() && a_shape[1].as_ref() != b_shape[0].as_ref() {
            return Err(Error::InputShapeError(format!("Gemm inner dims differ: {} vs {}", a_shape, b_shape)))
        }
        let output_shape = Shape::new(vec![a_shape[0].clone(), b_shape[1].clone()]);
        if let Some(c) = &c {
            output_shape.broadcast(c.shape())?;
        }
        Ok(Arc::new(Self {
            name,
            a,
            b,
            c,
            trans_a,
            trans_b,
            alpha,
            beta,
            output_shape
        }))
    }
}

impl Node for Gemm {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        if let Some(c) = &self.c {
            vec![&*self.a, &*self.b, c.as_ref()]
        } else {
            vec![&*self.a, &*self.b]
        }
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Gemm"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attr_float("alpha", self.alpha),
            attr_float("beta", self.beta),
            attr_int("transA", self.trans_a as i64),
            attr_int("transB", self.trans_b as i64),
        ]
    }
}

impl SingleOutputNode for Gemm {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

/// How a sliding window treats the borders of its input.
#[derive(Clone, Debug, PartialEq)]
pub enum Padding {
    /// Begin pads for every spatial axis, followed by the end pads.
    Explicit(Vec<i64>),
    /// `auto_pad = SAME_UPPER`, for inputs whose spatial size is unknown.
    SameUpper,
    /// No padding; written as all-zero pads.
    Valid,
}

/// Window geometry shared by convolutions and pooling.
#[derive(Clone, Debug)]
pub struct WindowParams {
    pub kernel_shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub padding: Padding,
}

impl WindowParams {
    pub fn new(kernel_shape: Vec<usize>, strides: Vec<usize>, dilations: Vec<usize>, padding: Padding) -> Self {
        Self { kernel_shape, strides, dilations, padding }
    }

    fn spatial_rank(&self) -> usize {
        self.kernel_shape.len()
    }

    fn validate(&self, input: &dyn Tensor) -> Result<(), Error> {
        let rank = self.spatial_rank();
        if rank == 0 || input.rank() != rank + 2 {
            return Err(Error::InputShapeError(format!("{}-d window does not fit input {}", rank, input.shape())));
        }
        if self.strides.len() != rank || self.dilations.len() != rank {
            return Err(Error::InvalidInputError(format!("window params disagree on rank: {:?}", self)));
        }
        if self.kernel_shape.contains(&0) || self.strides.contains(&0) || self.dilations.contains(&0) {
            return Err(Error::InvalidInputError(format!("window params must be positive: {:?}", self)));
        }
        if let Padding::Explicit(pads) = &self.padding {
            if pads.len() != 2 * rank || pads.iter().any(|x| *x < 0) {
                return Err(Error::InvalidInputError(format!("bad pads {:?} for {}-d window", pads, rank)));
            }
        }
        Ok(())
    }

    fn output_dim(&self, axis: usize, input: &Dimension) -> Result<Arc<Dimension>, Error> {
        let Some(size) = input.value else {
            return Ok(unknown_dim());
        };
        let size = size as i64;
        let stride = self.strides[axis] as i64;
        let extent = self.dilations[axis] as i64 * (self.kernel_shape[axis] as i64 - 1) + 1;
        let padded = match &self.padding {
            Padding::SameUpper => return Ok(Arc::new(Dimension::from(((size + stride - 1) / stride) as usize))),
            Padding::Valid => size,
            Padding::Explicit(pads) => size + pads[axis] + pads[axis + self.spatial_rank()],
        };
        if padded < extent {
            return Err(Error::InputShapeError(format!("window of extent {} does not fit axis of size {}", extent, padded)));
        }
        Ok(Arc::new(Dimension::from(((padded - extent) / stride + 1) as usize)))
    }

    fn output_shape(&self, input: &dyn Tensor, channels: Arc<Dimension>) -> Result<Shape, Error> {
        let mut dims = vec![input.shape()[0].clone(), channels];
        for axis in 0..self.spatial_rank() {
            dims.push(self.output_dim(axis, &input.shape()[axis + 2])?);
        }
        Ok(Shape::new(dims))
    }

    fn attributes(&self, with_dilations: bool) -> Vec<onnx::AttributeProto> {
        let to_i64 = |v: &[usize]| v.iter().map(|x| *x as i64).collect::<Vec<_>>();
        let mut attributes = vec![attr_ints("kernel_shape", &to_i64(&self.kernel_shape))];
        match &self.padding {
            Padding::Explicit(pads) => attributes.push(attr_ints("pads", pads)),
            Padding::SameUpper => attributes.push(attr_string("auto_pad", "SAME_UPPER")),
            Padding::Valid => attributes.push(attr_ints("pads", &vec![0; 2 * self.spatial_rank()])),
        }
        attributes.push(attr_ints("strides", &to_i64(&self.strides)));
        if with_dilations {
            attributes.push(attr_ints("dilations", &to_i64(&self.dilations)));
        }
        attributes
    }
}

pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    params: WindowParams,
    group: usize,
    output_shape: Shape
}

impl Conv {
    /// Channels-first convolution. `weight` is laid out `(out, in / group, k...)`.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, params: WindowParams, group: usize) -> Result<Arc<Self>, Error> {
        params.validate(input.as_ref())?;
        if input.dtype() != weight.dtype() {
            return Err(Error::DTypeMismatchError(input.dtype(), weight.dtype()));
        }
        let weight_dims = weight.shape().resolve()?;
        if weight_dims.len() != input.rank() || weight_dims[2..] != params.kernel_shape[..] {
            return Err(Error::InputShapeError(format!("Conv weight {} does not match kernel {:?}", weight.shape(), params.kernel_shape)));
        }
        if group == 0 || weight_dims[0] % group != 0 {
            return Err(Error::InvalidInputError(format!("{} output channels cannot be split into {} groups", weight_dims[0], group)));
        }
        if let Some(channels) = input.shape()[1].value {
            if channels != weight_dims[1] * group {
                return Err(Error::InputShapeError(format!("Conv input has {} channels, weight expects {}", channels, weight_dims[1] * group)));
            }
        }
        if let Some(bias) = &bias {
            if bias.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError(input.dtype(), bias.dtype()));
            }
            if bias.shape().resolve()? != vec![weight_dims[0]] {
                return Err(Error::InputShapeError(format!("Conv bias {} does not match {} output channels", bias.shape(), weight_dims[0])));
            }
        }
        let output_shape = params.output_shape(input.as_ref(), Arc::new(Dimension::from(weight_dims[0])))?;
        Ok(Arc::new(Self { name, input, weight, bias, params, group, output_shape }))
    }
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Conv"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        let mut attributes = self.params.attributes(true);
        attributes.push(attr_int("group", self.group as i64));
        attributes
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Average,
}

/// `MaxPool` / `AveragePool`. Average pooling never counts padded cells.
pub struct Pool {
    name: Option<String>,
    kind: PoolKind,
    input: Arc<dyn Tensor>,
    params: WindowParams,
    output_shape: Shape
}

impl Pool {
    pub fn new(name: Option<String>, kind: PoolKind, input: Arc<dyn Tensor>, params: WindowParams) -> Result<Arc<Self>, Error> {
        params.validate(input.as_ref())?;
        if !input.dtype().is_float() {
            return Err(Error::InvalidDTypeError(input.dtype(), "pooling"));
        }
        let output_shape = params.output_shape(input.as_ref(), input.shape()[1].clone())?;
        Ok(Arc::new(Self { name, kind, input, params, output_shape }))
    }
}

impl Node for Pool {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        match self.kind {
            PoolKind::Max => "MaxPool",
            PoolKind::Average => "AveragePool",
        }
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        let mut attributes = self.params.attributes(false);
        if self.kind == PoolKind::Average {
            attributes.push(attr_int("count_include_pad", 0));
        }
        attributes
    }
}

impl SingleOutputNode for Pool {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// `GlobalMaxPool` / `GlobalAveragePool`; spatial axes collapse to 1.
pub struct GlobalPool {
    name: Option<String>,
    kind: PoolKind,
    input: Arc<dyn Tensor>,
    output_shape: Shape
}

impl GlobalPool {
    pub fn new(name: Option<String>, kind: PoolKind, input: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if input.rank() < 3 {
            return Err(Error::InputShapeError(format!("global pooling needs spatial axes, got {}", input.shape())));
        }
        let mut dims = input.shape().dims[..2].to_vec();
        for _ in 2..input.rank() {
            dims.push(Arc::new(Dimension::from(1)));
        }
        Ok(Arc::new(Self { name, kind, input, output_shape: Shape::new(dims) }))
    }
}

impl Node for GlobalPool {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        match self.kind {
            PoolKind::Max => "GlobalMaxPool",
            PoolKind::Average => "GlobalAveragePool",
        }
    }
}

impl SingleOutputNode for GlobalPool {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct BatchNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Arc<dyn Tensor>,
    mean: Arc<dyn Tensor>,
    var: Arc<dyn Tensor>,
    epsilon: f32
}

impl BatchNormalization {
    /// Inference-mode batch norm over axis 1.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, bias: Arc<dyn Tensor>, mean: Arc<dyn Tensor>, var: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<Self>, Error> {
        if input.rank() < 2 {
            return Err(Error::InputShapeError(format!("BatchNormalization needs a channel axis, got {}", input.shape())));
        }
        for param in [&scale, &bias, &mean, &var] {
            if param.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError(input.dtype(), param.dtype()));
            }
            if param.rank() != 1 || (input.shape()[1].value.is_some() && param.shape()[0].as_ref() != input.shape()[1].as_ref()) {
                return Err(Error::InputShapeError(format!("BatchNormalization parameter {} does not match input {}", param.shape(), input.shape())));
            }
        }
        Ok(Arc::new(Self { name, input, scale, bias, mean, var, epsilon }))
    }
}

impl Node for BatchNormalization {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.scale.as_ref(), self.bias.as_ref(), self.mean.as_ref(), self.var.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "BatchNormalization"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_float("epsilon", self.epsilon)]
    }
}

impl SingleOutputNode for BatchNormalization {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Constant-mode Pad. `pads` must be a resolvable int64 tensor.
pub struct Pad {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    pads: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Pad {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, pads: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if pads.dtype() != DType::I64 {
            return Err(Error::InvalidDTypeError(pads.dtype(), "Pad pads"));
        }
        let pad_values = pads.resolve_data().ok_or(Error::CannotResolveDataError("Pad pads"))?.to_int_vec()?;
        let rank = input.rank();
        if pad_values.len() != 2 * rank || pad_values.iter().any(|x| *x < 0) {
            return Err(Error::InvalidInputError(format!("pads {:?} do not fit rank {}", pad_values, rank)));
        }
        let dims = input.shape().dims.iter().enumerate().map(|(i, dim)| {
            let (begin, end) = (pad_values[i], pad_values[i + rank]);
            if begin == 0 && end == 0 {
                dim.clone()
            } else {
                match dim.value {
                    Some(v) => Arc::new(Dimension::from(v + (begin + end) as usize)),
                    None => unknown_dim(),
                }
            }
        }).collect();
        Ok(Arc::new(Self { name, input, pads, output_shape: Shape::new(dims) }))
    }
}

impl Node for Pad {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.pads.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Pad"
    }
}

impl SingleOutputNode for Pad {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Option<Vec<i64>>,
    output_shape: Shape
}

impl Transpose {
    /// Without `perm` the axes are reversed.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, perm: Option<Vec<i64>>) -> Result<Arc<Self>, Error> {
        let output_shape = match &perm {
            Some(perm) => {
                let perm: Vec<usize> = perm.iter().map(|x| *x as usize).collect();
                if !is_permutation(&perm, input.rank()) {
                    return Err(Error::InvalidInputError(format!("{:?} is not a permutation of rank {}", perm, input.rank())));
                }
                input.shape().permute(&perm)?
            }
            None => input.shape().transpose(),
        };
        Ok(Arc::new(Self { name, input, perm, output_shape }))
    }
}

impl Node for Transpose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Transpose"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        match &self.perm {
            Some(perm) => vec![attr_ints("perm", perm)],
            None => vec![],
        }
    }
}

impl SingleOutputNode for Transpose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Reshape {
    /// `shape` must resolve to int64 data; `0` copies the input dim and one `-1` is inferred.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>) -> Result<Arc<Reshape>, Error> {
        if shape.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(shape.dtype(), "Reshape shape"))?
        }
        let targets = shape.resolve_data().ok_or(Error::CannotResolveDataError("Reshape shape"))?.to_int_vec()?;
        let input_dims = &input.shape().dims;

        let mut output_dims: Vec<Option<Arc<Dimension>>> = vec![];
        let mut copied: Vec<&Arc<Dimension>> = vec![];
        let mut inferred_axis = None;
        for (i, target) in targets.iter().enumerate() {
            match *target {
                0 => {
                    let dim = input_dims.get(i).ok_or_else(|| Error::InvalidInputError(format!("Reshape copies axis {} past input rank {}", i, input_dims.len())))?;
                    copied.push(dim);
                    output_dims.push(Some(dim.clone()));
                }
                -1 if inferred_axis.is_none() => {
                    inferred_axis = Some(i);
                    output_dims.push(None);
                }
                x if x > 0 => output_dims.push(Some(Arc::new(Dimension::from(x as usize)))),
                x => Err(Error::InvalidInputError(format!("bad Reshape target {} in {:?}", x, targets)))?,
            }
        }

        // Copied dims cancel out, so a symbolic batch axis does not block inference
        let remaining_input: Option<usize> = input_dims.iter()
            .filter(|dim| !copied.iter().any(|c| Arc::ptr_eq(c, dim)))
            .map(|dim| dim.value)
            .product();
        let known_output: usize = targets.iter().filter(|x| **x > 0).map(|x| *x as usize).product();

        if let Some(axis) = inferred_axis {
            let dim = match remaining_input {
                Some(total) if known_output > 0 && total % known_output == 0 => Arc::new(Dimension::from(total / known_output)),
                Some(total) => Err(Error::InputShapeError(format!("cannot reshape {} elements into {:?}", total, targets)))?,
                None => unknown_dim(),
            };
            output_dims[axis] = Some(dim);
        } else if let Some(total) = remaining_input {
            if total != known_output {
                Err(Error::InputShapeError(format!("cannot reshape {} into {:?}", input.shape(), targets)))?
            }
        }

        let output_shape = Shape::new(output_dims.into_iter().flatten().collect());
        Ok(Arc::new(Reshape {
            name,
            input,
            shape,
            output_shape
        }))
    }
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Flatten {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: usize,
    output_shape: Shape
}

impl Flatten {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: usize) -> Result<Arc<Self>, Error> {
        if axis > input.rank() {
            return Err(Error::InvalidInputError(format!("Flatten axis {} past rank {}", axis, input.rank())));
        }
        let collapse = |dims: &[Arc<Dimension>]| -> Arc<Dimension> {
            if dims.len() == 1 {
                return dims[0].clone();
            }
            match dims.iter().map(|x| x.value).product::<Option<usize>>() {
                Some(v) => Arc::new(Dimension::from(v)),
                None => unknown_dim(),
            }
        };
        let dims = &input.shape().dims;
        let output_shape = Shape::new(vec![collapse(&dims[..axis]), collapse(&dims[axis..])]);
        Ok(Arc::new(Self { name, input, axis, output_shape }))
    }
}

impl Node for Flatten {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Flatten"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("axis", self.axis as i64)]
    }
}

impl SingleOutputNode for Flatten {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Concat {
    name: Option<String>,
    inputs: Vec<Arc<dyn Tensor>>,
    axis: i64,
    output_shape: Shape
}

impl Concat {
    pub fn new(name: Option<String>, inputs: Vec<Arc<dyn Tensor>>, axis: i64) -> Result<Arc<Self>, Error> {
        if inputs.is_empty() {
            return Err(Error::InvalidInputError("Concat needs at least one input".to_string()));
        }
        let first = inputs[0].shape();
        let rank = first.rank() as i64;
        if axis < -rank || axis >= rank {
            return Err(Error::InvalidInputError(format!("Concat axis {} out of range for rank {}", axis, rank)));
        }
        let axis_index = first.normalize_axis(axis as isize);

        let mut dims = first.dims.clone();
        let mut concat_len = Some(0usize);
        for input in &inputs {
            if input.dtype() != inputs[0].dtype() {
                return Err(Error::DTypeMismatchError(inputs[0].dtype(), input.dtype()));
            }
            if input.rank() != first.rank() {
                return Err(Error::InputShapeError(format!("Concat inputs differ in rank: {} vs {}", first, input.shape())));
            }
            for (i, dim) in input.shape().dims.iter().enumerate() {
                if i == axis_index {
                    concat_len = concat_len.zip(dim.value).map(|(a, b)| a + b);
                } else if dims[i].value.is_none() && dim.value.is_some() {
                    dims[i] = dim.clone();
                } else if dims[i].value.is_some() && dim.value.is_some() && dims[i].as_ref() != dim.as_ref() {
                    return Err(Error::InputShapeError(format!("Concat inputs disagree off axis {}: {} vs {}", axis, first, input.shape())));
                }
            }
        }
        dims[axis_index] = match concat_len {
            Some(v) => Arc::new(Dimension::from(v)),
            None => unknown_dim(),
        };
        Ok(Arc::new(Self { name, inputs, axis, output_shape: Shape::new(dims) }))
    }
}

impl Node for Concat {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        self.inputs.iter().map(|x| x.as_ref()).collect()
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Concat"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
}

impl SingleOutputNode for Concat {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.inputs[0].dtype()
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant {
            name,
            data
        })
    }
}

impl Node for Constant {
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        // Shapes are always resolved for host data
        match self.data.to_tensor_data_proto(None) {
            Ok(value) => vec![attr_tensor("value", value)],
            Err(_) => vec![],
        }
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }

    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{InputTensor, WeightTensor};

    fn nchw(dims: Vec<Option<usize>>) -> Arc<dyn Tensor> {
        let dims = dims.into_iter().map(|v| Dimension::new(v, None, None)).collect();
        InputTensor::new("x".to_string(), DType::F32, Shape::new(dims))
    }

    fn ints(values: Vec<i64>) -> Arc<dyn Tensor> {
        let len = values.len();
        Constant::new(None, TensorData::new(values.into(), Shape::from(vec![len])).unwrap())
    }

    #[test]
    fn conv_output_shape_for_each_padding() {
        let input = nchw(vec![None, Some(3), Some(224), Some(224)]);
        let weight = WeightTensor::new("w".to_string(), TensorData::zeros(Shape::from(vec![8usize, 3, 3, 3]), DType::F32).unwrap());
        let same = WindowParams::new(vec![3, 3], vec![2, 2], vec![1, 1], Padding::Explicit(vec![0, 0, 1, 1]));
        let conv = Conv::new(None, input.clone(), weight.clone(), None, same, 1).unwrap();
        assert_eq!(conv.shape().dims[1].value, Some(8));
        assert_eq!(conv.shape().dims[2].value, Some(112));
        assert!(Arc::ptr_eq(&conv.shape().dims[0], &input.shape().dims[0]));

        let valid = WindowParams::new(vec![3, 3], vec![1, 1], vec![1, 1], Padding::Valid);
        let conv = Conv::new(None, input, weight, None, valid, 1).unwrap();
        assert_eq!(conv.shape().dims[3].value, Some(222));
        let pads = conv.get_onnx_attributes().into_iter().find(|a| a.name == "pads").unwrap();
        assert_eq!(pads.ints, vec![0, 0, 0, 0]);
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let input = nchw(vec![Some(1), Some(4), Some(8), Some(8)]);
        let weight = WeightTensor::new("w".to_string(), TensorData::zeros(Shape::from(vec![8usize, 3, 3, 3]), DType::F32).unwrap());
        let params = WindowParams::new(vec![3, 3], vec![1, 1], vec![1, 1], Padding::Valid);
        assert!(Conv::new(None, input, weight, None, params, 1).is_err());
    }

    #[test]
    fn same_upper_pool_rounds_up() {
        let input = nchw(vec![Some(1), Some(4), Some(7), None]);
        let params = WindowParams::new(vec![2, 2], vec![2, 2], vec![1, 1], Padding::SameUpper);
        let pool = Pool::new(None, PoolKind::Average, input, params).unwrap();
        assert_eq!(pool.shape().dims[2].value, Some(4));
        assert_eq!(pool.shape().dims[3].value, None);
        assert_eq!(pool.get_onnx_type(), "AveragePool");
    }

    #[test]
    fn reshape_infers_around_symbolic_batch() {
        let input = nchw(vec![None, Some(4), Some(4), Some(3)]);
        let reshape = Reshape::new(None, input.clone(), ints(vec![0, -1])).unwrap();
        assert_eq!(reshape.shape().dims[1].value, Some(48));
        assert!(Arc::ptr_eq(&reshape.shape().dims[0], &input.shape().dims[0]));
        assert!(Reshape::new(None, input, ints(vec![0, 5])).is_err());
    }

    #[test]
    fn flatten_keeps_batch_dim() {
        let input = nchw(vec![None, Some(2), Some(3), Some(4)]);
        let flat = Flatten::new(None, input.clone(), 1).unwrap();
        assert!(Arc::ptr_eq(&flat.shape().dims[0], &input.shape().dims[0]));
        assert_eq!(flat.shape().dims[1].value, Some(24));
    }

    #[test]
    fn concat_sums_axis() {
        let a = nchw(vec![None, Some(2), Some(5)]);
        let b = nchw(vec![None, Some(2), Some(7)]);
        let concat = Concat::new(None, vec![a, b], -1).unwrap();
        assert_eq!(concat.shape().dims[2].value, Some(12));
    }

    #[test]
    fn pad_grows_known_dims() {
        let input = nchw(vec![None, Some(3), Some(5), Some(5)]);
        let pad = Pad::new(None, input, ints(vec![0, 0, 1, 2, 0, 0, 1, 2])).unwrap();
        assert_eq!(pad.shape().dims[2].value, Some(7));
        assert_eq!(pad.shape().dims[3].value, Some(9));
    }

    #[test]
    fn clip_without_min_leaves_empty_input() {
        let x = nchw(vec![Some(2)]);
        let max = Constant::new(None, TensorData::fill(Shape::scalar(), 6.0f32).unwrap());
        let clip = Clip::new(None, x.clone(), None, Some(max.clone())).unwrap();
        let mut names: HashMap<&dyn Tensor, String> = HashMap::new();
        names.insert(x.as_ref(), "x".to_string());
        names.insert(max.as_ref(), "six".to_string());
        names.insert(clip.as_ref(), "y".to_string());
        let proto = clip.to_node_proto(None, &names);
        assert_eq!(proto.input, vec!["x".to_string(), String::new(), "six".to_string()]);
    }

    #[test]
    fn transpose_moves_channels() {
        let x = nchw(vec![None, Some(8), Some(8), Some(3)]);
        let t = Transpose::new(None, x, Some(vec![0, 3, 1, 2])).unwrap();
        assert_eq!(t.shape().dims[1].value, Some(3));
        assert_eq!(t.shape().dims[3].value, Some(8));
    }
}
