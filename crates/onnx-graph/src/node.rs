use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use crate::onnx;
use crate::tensor::{Shape, TensorData};
use crate::tensor::Tensor;
use crate::DType;

pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;
    fn get_onnx_domain(&self) -> &str {
        ""
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![]
    }

    fn to_node_proto(&self, name: Option<String>, tensor_names: &HashMap<&dyn Tensor, String>) -> onnx::NodeProto {
        onnx::NodeProto {
            name: name.unwrap_or_default(),
            input: self.get_input_tensors().iter().map(|tensor| tensor_names[tensor].clone()).collect(),
            output: self.get_output_tensors().iter().map(|tensor| tensor_names[tensor].clone()).collect(),
            op_type: self.get_onnx_type().to_string(),
            domain: self.get_onnx_domain().to_string(),
            attribute: self.get_onnx_attributes(),
            .. Default::default()
        }
    }
}

impl PartialEq for &dyn Node{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl Eq for &dyn Node{}

impl Hash for &dyn Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

pub(crate) trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;

    fn resolve_output_data(&self) -> Option<TensorData> {
        None
    }
}

pub(crate) fn attr_int(name: &str, value: i64) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::Int as i32,
        i: value,
        .. Default::default()
    }
}

pub(crate) fn attr_ints(name: &str, values: &[i64]) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::Ints as i32,
        ints: values.to_vec(),
        .. Default::default()
    }
}

pub(crate) fn attr_float(name: &str, value: f32) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::Float as i32,
        f: value,
        .. Default::default()
    }
}

pub(crate) fn attr_string(name: &str, value: &str) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::String as i32,
        s: value.as_bytes().to_vec(),
        .. Default::default()
    }
}

pub(crate) fn attr_tensor(name: &str, value: onnx::TensorProto) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        r#type: onnx::attribute_proto::AttributeType::Tensor as i32,
        t: Some(value),
        .. Default::default()
    }
}
