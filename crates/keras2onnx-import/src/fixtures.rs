//! Writers for small Keras `.h5` files laid out the way TensorFlow 2 saves them. Used by the
//! tests of this crate and of the converter binary.

use std::path::Path;
use serde_json::{json, Value};
use onnx_graph::tensor::{Shape, TensorData};
use crate::hdf5::writer::H5Builder;
use crate::hdf5::H5Error;

pub struct KerasFileBuilder {
    model_config: Option<Value>,
    keras_version: Option<String>,
    backend: Option<String>,
    fixed_length_config: bool,
    layers: Vec<(String, Vec<(String, TensorData)>)>,
}

impl KerasFileBuilder {
    /// A full-model save of `model_config` (`{"class_name": ..., "config": ...}`).
    pub fn new(model_config: Value) -> Self {
        Self {
            model_config: Some(model_config),
            keras_version: Some("2.15.0".to_string()),
            backend: Some("tensorflow".to_string()),
            fixed_length_config: false,
            layers: vec![],
        }
    }

    /// A `save_weights` file: weights at the root and no model config.
    pub fn weights_only() -> Self {
        Self { model_config: None, keras_version: Some("2.15.0".to_string()), backend: Some("tensorflow".to_string()), fixed_length_config: false, layers: vec![] }
    }

    pub fn keras_version(mut self, version: Option<&str>) -> Self {
        self.keras_version = version.map(str::to_string);
        self
    }

    pub fn backend(mut self, backend: Option<&str>) -> Self {
        self.backend = backend.map(str::to_string);
        self
    }

    /// Stores `model_config` as a fixed-length byte string, as older h5py versions did.
    pub fn fixed_length_config(mut self) -> Self {
        self.fixed_length_config = true;
        self
    }

    /// Adds a layer's weights. Names are relative to the layer (e.g. `kernel`, or
    /// `inner/kernel` for a layer of a nested model) and saved as `<layer>/<name>:0`.
    pub fn layer_weights(mut self, layer: &str, weights: Vec<(&str, TensorData)>) -> Self {
        self.layers.push((layer.to_string(), weights.into_iter().map(|(name, data)| (name.to_string(), data)).collect()));
        self
    }

    /// Declares a layer that owns no weights, which Keras still lists in `layer_names`.
    pub fn layer_without_weights(self, layer: &str) -> Self {
        self.layer_weights(layer, vec![])
    }

    pub fn build(&self) -> Result<Vec<u8>, H5Error> {
        let mut h5 = H5Builder::new();
        let root = h5.root();
        if let Some(config) = &self.model_config {
            let text = config.to_string();
            if self.fixed_length_config {
                root.attr_bytes("model_config", &text);
            } else {
                root.attr_str("model_config", &text);
            }
        }
        if let Some(version) = &self.keras_version {
            root.attr_str("keras_version", version);
        }
        if let Some(backend) = &self.backend {
            root.attr_str("backend", backend);
        }

        let weights = if self.model_config.is_some() { root.group("model_weights") } else { root };
        let layer_names: Vec<&str> = self.layers.iter().map(|(name, _)| name.as_str()).collect();
        weights.attr_strings("layer_names", &layer_names);
        for (layer, tensors) in &self.layers {
            let group = weights.group(layer);
            let weight_names: Vec<String> = tensors.iter().map(|(name, _)| format!("{}/{}:0", layer, name)).collect();
            let refs: Vec<&str> = weight_names.iter().map(String::as_str).collect();
            group.attr_strings("weight_names", &refs);
            for (weight_name, (_, data)) in weight_names.iter().zip(tensors) {
                let (dir, leaf) = weight_name.rsplit_once('/').unwrap_or(("", weight_name));
                group.group(dir).dataset(leaf, data)?;
            }
        }
        h5.build()
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), H5Error> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }
}

/// `{"class_name": class_name, "config": config}` with `name` filled in.
pub fn layer(class_name: &str, name: &str, mut config: Value) -> Value {
    if let Value::Object(map) = &mut config {
        map.insert("name".to_string(), json!(name));
    }
    json!({"class_name": class_name, "name": name, "config": config})
}

/// A layer entry of a functional model, called once on `inbound`.
pub fn call(class_name: &str, name: &str, config: Value, inbound: &[&str]) -> Value {
    let mut entry = layer(class_name, name, config);
    let args: Vec<Value> = inbound.iter().map(|source| json!([source, 0, 0, {}])).collect();
    entry["inbound_nodes"] = json!([args]);
    entry
}

pub fn input_layer(name: &str, shape: &[Option<usize>], dtype: &str) -> Value {
    let mut entry = layer("InputLayer", name, json!({"batch_input_shape": shape, "dtype": dtype}));
    entry["inbound_nodes"] = json!([]);
    entry
}

pub fn sequential(name: &str, layers: Vec<Value>) -> Value {
    json!({"class_name": "Sequential", "config": {"name": name, "layers": layers}})
}

pub fn functional(name: &str, layers: Vec<Value>, inputs: &[&str], outputs: &[&str]) -> Value {
    let refs = |names: &[&str]| names.iter().map(|n| json!([n, 0, 0])).collect::<Vec<_>>();
    json!({
        "class_name": "Functional",
        "config": {"name": name, "layers": layers, "input_layers": refs(inputs), "output_layers": refs(outputs)}
    })
}

/// Deterministic float32 weights: small values cycling through a fixed pattern.
pub fn ramp(shape: &[usize]) -> TensorData {
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|i| ((i % 17) as f32 - 8.0) / 64.0).collect();
    TensorData::new(values.into(), Shape::from(shape.to_vec())).expect("ramp shape matches its data")
}

pub fn filled(shape: &[usize], value: f32) -> TensorData {
    let count: usize = shape.iter().product();
    TensorData::new(vec![value; count].into(), Shape::from(shape.to_vec())).expect("fill shape matches its data")
}
