#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;
use prost::Message;
use serde_json::{json, Value};
use keras2onnx_import::fixtures::{call, filled, functional, input_layer, layer, ramp, sequential, KerasFileBuilder};
use onnx_graph::onnx;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A small CNN over a single 224x224 RGB image.
pub fn image_classifier() -> KerasFileBuilder {
    let config = sequential(
        "image_classifier",
        vec![
            input_layer("image", &[Some(1), Some(224), Some(224), Some(3)], "float32"),
            layer("Conv2D", "conv", json!({"filters": 4, "kernel_size": [3, 3], "strides": [2, 2], "padding": "same", "activation": "linear", "use_bias": true})),
            layer("BatchNormalization", "bn", json!({"axis": [3], "epsilon": 0.001, "center": true, "scale": true})),
            layer("ReLU", "relu", json!({"max_value": 6.0})),
            layer("MaxPooling2D", "pool", json!({"pool_size": [2, 2], "padding": "valid"})),
            layer("GlobalAveragePooling2D", "gap", json!({})),
            layer("Dropout", "dropout", json!({"rate": 0.2})),
            layer("Dense", "logits", json!({"units": 5, "activation": "softmax", "use_bias": true})),
        ],
    );
    KerasFileBuilder::new(config)
        .layer_weights("conv", vec![("kernel", ramp(&[3, 3, 3, 4])), ("bias", filled(&[4], 0.1))])
        .layer_weights(
            "bn",
            vec![
                ("gamma", filled(&[4], 1.0)),
                ("beta", filled(&[4], 0.0)),
                ("moving_mean", filled(&[4], 0.5)),
                ("moving_variance", filled(&[4], 2.0)),
            ],
        )
        .layer_without_weights("relu")
        .layer_without_weights("pool")
        .layer_without_weights("gap")
        .layer_without_weights("dropout")
        .layer_weights("logits", vec![("kernel", ramp(&[4, 5])), ("bias", filled(&[5], 0.0))])
}

/// A dense network with an unknown batch dimension.
pub fn tabular_model(dtype: &str) -> KerasFileBuilder {
    let config = sequential(
        "tabular",
        vec![
            input_layer("features", &[None, Some(6)], dtype),
            layer("Dense", "hidden", json!({"units": 8, "activation": "relu"})),
            layer("Dense", "score", json!({"units": 1, "activation": "sigmoid"})),
        ],
    );
    KerasFileBuilder::new(config)
        .layer_weights("hidden", vec![("kernel", ramp(&[6, 8])), ("bias", filled(&[8], 0.0))])
        .layer_weights("score", vec![("kernel", ramp(&[8, 1])), ("bias", filled(&[1], 0.0))])
}

/// A Sequential model saved before it was built, so nothing declares its input shape.
pub fn unbuilt_model() -> KerasFileBuilder {
    let config = sequential("unbuilt", vec![layer("Dense", "dense", json!({"units": 2}))]);
    KerasFileBuilder::new(config).layer_weights("dense", vec![("kernel", ramp(&[3, 2])), ("bias", filled(&[2], 0.0))])
}

/// Bytes that are not an HDF5 file at all.
pub const NOT_HDF5: &[u8] = b"PK\x03\x04 this is a zip archive, not a Keras HDF5 save";

/// Two convolution branches merged with `Add` and `Concatenate`.
pub fn branching_model() -> KerasFileBuilder {
    let conv = |filters: usize| json!({"filters": filters, "kernel_size": 1, "padding": "valid", "use_bias": false});
    let config = functional(
        "branches",
        vec![
            input_layer("pixels", &[None, Some(8), Some(8), Some(3)], "float32"),
            call("Conv2D", "left", conv(2), &["pixels"]),
            call("Conv2D", "right", conv(2), &["pixels"]),
            call("Add", "sum", json!({}), &["left", "right"]),
            call("Concatenate", "stack", json!({"axis": -1}), &["sum", "left"]),
            call("Flatten", "flat", json!({}), &["stack"]),
        ],
        &["pixels"],
        &["flat", "sum"],
    );
    KerasFileBuilder::new(config)
        .layer_weights("left", vec![("kernel", ramp(&[1, 1, 3, 2]))])
        .layer_weights("right", vec![("kernel", ramp(&[1, 1, 3, 2]))])
}

/// A functional model that calls a nested `Sequential` encoder.
pub fn nested_model() -> KerasFileBuilder {
    let encoder = sequential(
        "encoder",
        vec![
            input_layer("encoder_in", &[None, Some(4)], "float32"),
            layer("Dense", "project", json!({"units": 3, "activation": "tanh"})),
        ],
    );
    let mut encoder_layer: Value = encoder;
    encoder_layer["name"] = json!("encoder");
    encoder_layer["inbound_nodes"] = json!([[["raw", 0, 0, {}]]]);
    let config = functional(
        "wrapper",
        vec![input_layer("raw", &[None, Some(4)], "float32"), encoder_layer, call("Dense", "head", json!({"units": 2}), &["encoder"])],
        &["raw"],
        &["head"],
    );
    KerasFileBuilder::new(config)
        .layer_weights("encoder", vec![("project/kernel", ramp(&[4, 3])), ("project/bias", filled(&[3], 0.0))])
        .layer_weights("head", vec![("kernel", ramp(&[3, 2])), ("bias", filled(&[2], 0.0))])
}

pub fn decode(path: &Path) -> onnx::ModelProto {
    let bytes = std::fs::read(path).unwrap();
    assert!(!bytes.is_empty());
    onnx::ModelProto::decode(bytes.as_slice()).unwrap()
}

pub fn graph(model: &onnx::ModelProto) -> &onnx::GraphProto {
    model.graph.as_ref().unwrap()
}

fn tensor_type(value_info: &onnx::ValueInfoProto) -> &onnx::type_proto::Tensor {
    match value_info.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(onnx::type_proto::Value::TensorType(tensor)) => tensor,
        other => panic!("{} is not a tensor: {:?}", value_info.name, other),
    }
}

pub fn elem_type(value_info: &onnx::ValueInfoProto) -> onnx::tensor_proto::DataType {
    onnx::tensor_proto::DataType::try_from(tensor_type(value_info).elem_type).unwrap()
}

/// Dimensions as strings: sizes for fixed dims, parameter names for symbolic ones.
pub fn dims(value_info: &onnx::ValueInfoProto) -> Vec<String> {
    use onnx::tensor_shape_proto::dimension::Value as Dim;
    tensor_type(value_info)
        .shape
        .as_ref()
        .unwrap()
        .dim
        .iter()
        .map(|d| match &d.value {
            Some(Dim::DimValue(v)) => v.to_string(),
            Some(Dim::DimParam(p)) => p.clone(),
            None => "?".to_string(),
        })
        .collect()
}

pub fn op_types(model: &onnx::ModelProto) -> Vec<&str> {
    graph(model).node.iter().map(|n| n.op_type.as_str()).collect()
}
