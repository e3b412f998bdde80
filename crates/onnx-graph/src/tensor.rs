use std::hash::{Hash, Hasher};
use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use crate::weights::WeightOutputManager;
use core::fmt;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimensionError)
    }

    pub fn is_one(&self) -> bool {
        self.value == Some(1)
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match value.value {
                Some(value) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(value as i64)),
                None => value.name.as_ref().map(|name| onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone()))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other) || if let (Some(a), Some(b)) = (self.value, other.value) {a == b} else {false}
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        }
        else if let Some(name) = &self.name {
            write!(f, "{}", name)
        }
        else {
            write!(f, "?")
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        let mut res = vec![];
        for dim in &self.dims {
            res.push(dim.resolve()?);
        }
        Ok(res)
    }

    pub fn transpose(&self) -> Self {
        Self {
            dims: self.dims.iter().rev().cloned().collect()
        }
    }

    /// Reorders dims so that output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self, Error> {
        if !is_permutation(perm, self.rank()) {
            return Err(Error::InvalidInputError(format!("{:?} is not a permutation of rank {}", perm, self.rank())));
        }
        Ok(Self { dims: perm.iter().map(|&p| self.dims[p].clone()).collect() })
    }

    pub fn dim(&self, index: isize) -> &Arc<Dimension> {
        &self.dims[self.normalize_axis(index)]
    }

    pub fn normalize_axis(&self, axis: isize) -> usize {
        let rank = self.rank();
        if axis < 0 {
            rank - (-axis) as usize
        }
        else {
            axis as usize
        }
    }

    pub fn unsqueeze(&self, axis: isize) -> Self {
        let axis = self.normalize_axis(axis);
        let mut new_dims = self.dims.clone();
        new_dims.insert(axis, Dimension::new(Some(1), None, None));
        Self::new(new_dims)
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v: usize = 1;
        for dim in &self.dims {
            v = v.checked_mul(dim.resolve()?).ok_or_else(|| Error::InputShapeError(format!("{} has too many elements", self)))?;
        }
        Ok(v)
    }

    /// Numpy-style broadcast of two shapes.
    ///
    /// Unknown dimensions broadcast against anything; the runtime has the final say on those.
    pub fn broadcast(&self, other: &Shape) -> Result<Shape, Error> {
        let rank = self.rank().max(other.rank());
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            let a = (i + self.rank()).checked_sub(rank).map(|x| &self.dims[x]);
            let b = (i + other.rank()).checked_sub(rank).map(|x| &other.dims[x]);
            let dim = match (a, b) {
                (Some(a), None) => a.clone(),
                (None, Some(b)) => b.clone(),
                (Some(a), Some(b)) => {
                    if a.as_ref() == b.as_ref() || b.is_one() {
                        a.clone()
                    }
                    else if a.is_one() {
                        b.clone()
                    }
                    else if a.value.is_none() {
                        if b.value.is_some() { b.clone() } else { a.clone() }
                    }
                    else if b.value.is_none() {
                        a.clone()
                    }
                    else {
                        return Err(Error::InputShapeError(format!("cannot broadcast {} with {}", self, other)));
                    }
                }
                (None, None) => unreachable!("broadcast rank covers both shapes"),
            };
            dims.push(dim);
        }
        Ok(Shape::new(dims))
    }
}

pub(crate) fn is_permutation(perm: &[usize], rank: usize) -> bool {
    if perm.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("x"))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl Shape {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<Shape> for onnx::TensorShapeProto {
    fn from(value: Shape) -> Self {
        (&value).into()
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    F16,
    BF16,
    I8,
    U8,
    I32,
    I64,
    Bool
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64 | DType::F16 | DType::BF16)
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F64 => onnx::tensor_proto::DataType::Double,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I8 => onnx::tensor_proto::DataType::Int8,
            DType::U8 => onnx::tensor_proto::DataType::Uint8,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
            DType::Bool => onnx::tensor_proto::DataType::Bool,
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub trait Tensor  {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: String::new()
                }
            ),
            .. Default::default()
        }
    }

    /// The node producing this tensor, if any.
    fn get_node(&self) -> Option<&dyn Node> {
        None
    }

    fn get_initializer(&self, _name: String, _manager: &mut dyn WeightOutputManager) -> Result<Option<TensorProto>, Error> {
        Ok(None)
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;
}

impl PartialEq for &dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl Eq for &dyn Tensor{}

impl Hash for &dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}


impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn get_node(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn get_name(&self) -> Option<&str> {
        <Self as Node>::get_name(self)
    }

    fn is_input(&self) -> bool {
        false
    }
}

pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// A constant that lands in the graph's initializer list.
pub struct WeightTensor {
    name: String,
    data: TensorData
}

impl WeightTensor {
    pub fn new(name: String, data: TensorData) -> Arc<Self> {
        Arc::new(Self { name, data })
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }
}

impl Tensor for WeightTensor {
    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn shape(&self) -> &Shape {
        self.data.shape()
    }

    fn get_initializer(&self, name: String, manager: &mut dyn WeightOutputManager) -> Result<Option<TensorProto>, Error> {
        Ok(Some(manager.get_initializer(name, &self.data)?))
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }

    fn is_input(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    F64(Vec<f64>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

fn decode_le<const N: usize, T>(data: &[u8], f: fn([u8; N]) -> T) -> Result<Vec<T>, Error> {
    if data.len() % N != 0 {
        return Err(Error::InvalidInputError(format!("{} bytes is not a multiple of element size {}", data.len(), N)));
    }
    Ok(data.chunks_exact(N).map(|chunk| {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(chunk);
        f(bytes)
    }).collect())
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::F64(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I8(v) => v.len(),
            TensorDataValue::U8(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
            TensorDataValue::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::F64(_) => DType::F64,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I8(_) => DType::I8,
            TensorDataValue::U8(_) => DType::U8,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
            TensorDataValue::Bool(_) => DType::Bool,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I8(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::U8(v) => v.clone(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::Bool(v) => v.iter().map(|x| *x as u8).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        Ok(match dtype {
            DType::F32 => TensorDataValue::F32(decode_le(data, f32::from_le_bytes)?),
            DType::F64 => TensorDataValue::F64(decode_le(data, f64::from_le_bytes)?),
            DType::F16 => TensorDataValue::F16(decode_le(data, half::f16::from_le_bytes)?),
            DType::BF16 => TensorDataValue::BF16(decode_le(data, half::bf16::from_le_bytes)?),
            DType::I8 => TensorDataValue::I8(decode_le(data, i8::from_le_bytes)?),
            DType::U8 => TensorDataValue::U8(data.to_vec()),
            DType::I32 => TensorDataValue::I32(decode_le(data, i32::from_le_bytes)?),
            DType::I64 => TensorDataValue::I64(decode_le(data, i64::from_le_bytes)?),
            DType::Bool => TensorDataValue::Bool(data.iter().map(|x| *x != 0).collect()),
        })
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<f64>> for TensorDataValue {
    fn from(value: Vec<f64>) -> Self {
        TensorDataValue::F64(value)
    }
}

impl From<Vec<half::bf16>> for TensorDataValue {
    fn from(value: Vec<half::bf16>) -> Self {
        TensorDataValue::BF16(value)
    }
}

impl From<Vec<half::f16>> for TensorDataValue {
    fn from(value: Vec<half::f16>) -> Self {
        TensorDataValue::F16(value)
    }
}

impl From<Vec<i32>> for TensorDataValue {
    fn from(value: Vec<i32>) -> Self {
        TensorDataValue::I32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

impl From<Vec<u8>> for TensorDataValue {
    fn from(value: Vec<u8>) -> Self {
        TensorDataValue::U8(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        let expected = shape.num_elements()?;
        if expected != value.len() {
            return Err(Error::InvalidInputError(format!("shape {} holds {} elements, got {}", shape, expected, value.len())));
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    /// A filled tensor of any dtype, with `value` converted to that dtype.
    pub fn fill_f64(shape: Shape, dtype: DType, value: f64) -> Result<Self, Error> {
        match dtype {
            DType::F32 => Self::fill(shape, value as f32),
            DType::F64 => Self::fill(shape, value),
            DType::F16 => Self::fill(shape, half::f16::from_f64(value)),
            DType::BF16 => Self::fill(shape, half::bf16::from_f64(value)),
            DType::I32 => Self::fill(shape, value as i32),
            DType::I64 => Self::fill(shape, value as i64),
            DType::U8 => Self::fill(shape, value as u8),
            DType::I8 => {
                let n = shape.num_elements()?;
                Self::new(TensorDataValue::I8(vec![value as i8; n]), shape)
            }
            DType::Bool => {
                let n = shape.num_elements()?;
                Self::new(TensorDataValue::Bool(vec![value != 0.0; n]), shape)
            }
        }
    }

    pub fn zeros(shape: Shape, dtype: DType) -> Result<Self, Error> {
        Self::fill_f64(shape, dtype, 0.0)
    }

    pub fn from_raw(dtype: DType, shape: Shape, data: &[u8]) -> Result<Self, Error> {
        let value = TensorDataValue::from_raw_encoding(dtype, data)?;
        Self::new(value, shape)
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            _ => Err(Error::UnsupportedDTypeError(self.dtype().to_string())),
        }
    }

    pub fn reshape(self, shape: Shape) -> Result<Self, Error> {
        Self::new(self.value, shape)
    }

    /// Host-side transpose: output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self, Error> {
        let dims = self.shape.resolve()?;
        let out_shape = self.shape.permute(perm)?;
        let out_dims = out_shape.resolve()?;
        let rank = dims.len();

        let mut in_strides = vec![1usize; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            in_strides[i] = in_strides[i + 1] * dims[i + 1];
        }

        let elem = self.dtype().size();
        let raw = self.value.get_raw_encoding();
        let mut out = vec![0u8; raw.len()];
        let mut index = vec![0usize; rank];
        for o in 0..self.value.len() {
            let src: usize = (0..rank).map(|i| index[i] * in_strides[perm[i]]).sum();
            out[o * elem..(o + 1) * elem].copy_from_slice(&raw[src * elem..(src + 1) * elem]);
            for axis in (0..rank).rev() {
                index[axis] += 1;
                if index[axis] < out_dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Self::from_raw(self.dtype(), out_shape, &out)
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permute_moves_channels_first() {
        // (h=1, w=2, c=3) -> (c, h, w)
        let data = TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0].into(), Shape::from(vec![1usize, 2, 3])).unwrap();
        let out = data.permute(&[2, 0, 1]).unwrap();
        assert_eq!(out.shape().resolve().unwrap(), vec![3, 1, 2]);
        assert_eq!(out.value(), &TensorDataValue::F32(vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]));
    }

    #[test]
    fn permute_rejects_bad_permutation() {
        let data = TensorData::zeros(Shape::from(vec![2usize, 2]), DType::F32).unwrap();
        assert!(data.permute(&[0, 0]).is_err());
        assert!(data.permute(&[0]).is_err());
    }

    #[test]
    fn broadcast_follows_numpy_rules() {
        let batch = Dimension::new(None, Some("batch_size".to_string()), None);
        let a = Shape::new(vec![batch.clone(), Arc::new(4usize.into()), Arc::new(3usize.into())]);
        let b = Shape::from(vec![3usize]);
        let out = a.broadcast(&b).unwrap();
        assert_eq!(out.rank(), 3);
        assert!(Arc::ptr_eq(&out.dims[0], &batch));
        assert_eq!(out.dims[2].value, Some(3));

        let c = Shape::from(vec![2usize]);
        assert!(a.broadcast(&c).is_err());
    }

    #[test]
    fn scalar_shape_holds_one_element() {
        let data = TensorData::fill(Shape::scalar(), 6.0f32).unwrap();
        assert_eq!(data.shape().num_elements().unwrap(), 1);
        let proto = data.to_tensor_data_proto(Some("six".to_string())).unwrap();
        assert!(proto.dims.is_empty());
        assert_eq!(proto.raw_data, 6.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn raw_decoding_checks_length() {
        assert!(TensorDataValue::from_raw_encoding(DType::F32, &[0, 0, 0]).is_err());
        let v = TensorDataValue::from_raw_encoding(DType::I64, &7i64.to_le_bytes()).unwrap();
        assert_eq!(v, TensorDataValue::I64(vec![7]));
    }
}
