use std::collections::HashMap;
use std::path::{Path, PathBuf};
use onnx_graph::tensor::{DType, Shape, TensorData};
use onnx_graph::weights::InMemoryWeightManager;
use crate::hdf5::{self, Datatype, Group, H5Error};
use crate::keras::config::{compute_dtype, LayerConfig, ModelConfig, ModelKind};
use crate::LoadError;

/// A declared model input: Keras name, shape with `None` for unknown dims, and dtype name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInput {
    pub name: String,
    pub shape: Vec<Option<usize>>,
    pub dtype: String,
}

/// A Keras model read from an HDF5 save file, with its weights in memory.
pub struct KerasModel {
    pub config: ModelConfig,
    pub inputs: Vec<ModelInput>,
    pub keras_version: Option<String>,
    pub backend: Option<String>,
    pub weights: InMemoryWeightManager,
}

impl KerasModel {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Keras 3 changed several defaults (e.g. `hard_sigmoid`); files without a version are
    /// treated as Keras 2, which wrote every legacy `.h5` file in the wild.
    pub fn is_keras3(&self) -> bool {
        self.keras_version.as_deref().is_some_and(|v| v.starts_with("3."))
    }
}

/// Loads a model saved with `model.save("....h5")`. Training configuration and optimizer state
/// are not read.
pub fn load(path: impl AsRef<Path>) -> Result<KerasModel, LoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LoadError::Missing(path.to_path_buf()));
    }
    let file = hdf5::File::open(path).map_err(|source| LoadError::Hdf5 { path: path.to_path_buf(), source })?;
    load_file(&file, path)
}

pub fn load_file(file: &hdf5::File, path: &Path) -> Result<KerasModel, LoadError> {
    let h5 = |source: H5Error| LoadError::Hdf5 { path: path.to_path_buf(), source };
    let root = file.root().map_err(h5)?;

    let model_config = root
        .attr("model_config")
        .map_err(h5)?
        .ok_or_else(|| not_a_model(path, "no model_config attribute found (is this a weights-only file?)"))?;
    let model_config = model_config.as_string().ok_or_else(|| not_a_model(path, "model_config is not a string"))?;
    let config = ModelConfig::from_json(model_config)?;

    let keras_version = root.attr("keras_version").map_err(h5)?.and_then(|a| a.as_string().map(str::to_string));
    let backend = root.attr("backend").map_err(h5)?.and_then(|a| a.as_string().map(str::to_string));
    log::info!(
        "Loading {:?} model {} (keras {}, backend {})",
        config.kind,
        config.name,
        keras_version.as_deref().unwrap_or("unknown"),
        backend.as_deref().unwrap_or("unknown")
    );

    let weights_group = if root.has_member("model_weights").map_err(h5)? { root.group("model_weights").map_err(h5)? } else { root };
    let weights = read_weights(&weights_group).map_err(|err| match err {
        WeightReadError::H5(source) => h5(source),
        WeightReadError::Load(err) => err,
    })?;
    let inputs = model_inputs(&config)?;
    Ok(KerasModel { config, inputs, keras_version, backend, weights })
}

fn not_a_model(path: &Path, reason: &str) -> LoadError {
    LoadError::NotAKerasModel { path: PathBuf::from(path), reason: reason.to_string() }
}

enum WeightReadError {
    H5(H5Error),
    Load(LoadError),
}

impl From<H5Error> for WeightReadError {
    fn from(value: H5Error) -> Self {
        WeightReadError::H5(value)
    }
}

impl From<LoadError> for WeightReadError {
    fn from(value: LoadError) -> Self {
        WeightReadError::Load(value)
    }
}

/// Reads a string-list attribute, including the `name0`, `name1`, ... form Keras uses when the
/// list exceeds the HDF5 header message limit.
fn string_list_attr(group: &Group, name: &str) -> Result<Vec<String>, WeightReadError> {
    if let Some(attr) = group.attr(name)? {
        return strings_of(&attr, name);
    }
    let mut out = vec![];
    for chunk in 0.. {
        match group.attr(&format!("{}{}", name, chunk))? {
            Some(attr) => out.extend(strings_of(&attr, name)?),
            None => break,
        }
    }
    Ok(out)
}

fn strings_of(attr: &hdf5::Attribute, name: &str) -> Result<Vec<String>, WeightReadError> {
    match attr.strings() {
        Some(strings) => Ok(strings.to_vec()),
        // an empty numpy array is stored as float64
        None if attr.shape.iter().product::<usize>() == 0 => Ok(vec![]),
        None => Err(LoadError::InvalidConfig(format!("attribute {} is not a list of strings", name)).into()),
    }
}

fn read_weights(group: &Group) -> Result<InMemoryWeightManager, WeightReadError> {
    let mut tensors = HashMap::new();
    for layer_name in string_list_attr(group, "layer_names")? {
        let layer = group.group(&layer_name)?;
        for weight_name in string_list_attr(&layer, "weight_names")? {
            let dataset = layer.dataset(&weight_name)?;
            let key = format!("{}/{}", layer_name, weight_name.strip_suffix(":0").unwrap_or(&weight_name));
            let data = read_dataset(&dataset, &key)?;
            log::debug!("Loaded weight {} {}", key, data.shape());
            tensors.insert(key, data);
        }
    }
    log::info!("Loaded {} weight tensors", tensors.len());
    Ok(InMemoryWeightManager::new(tensors))
}

fn weight_dtype(datatype: &Datatype) -> Option<DType> {
    Some(match datatype {
        Datatype::Float { size: 2, .. } => DType::F16,
        Datatype::Float { size: 4, .. } => DType::F32,
        Datatype::Float { size: 8, .. } => DType::F64,
        Datatype::FixedPoint { size: 1, signed: true, .. } => DType::I8,
        Datatype::FixedPoint { size: 1, signed: false, .. } => DType::U8,
        Datatype::FixedPoint { size: 4, signed: true, .. } => DType::I32,
        Datatype::FixedPoint { size: 8, signed: true, .. } => DType::I64,
        // h5py stores numpy bools as a one-byte enum
        Datatype::Enum { base } if base.size() == 1 => DType::Bool,
        _ => return None,
    })
}

fn read_dataset(dataset: &hdf5::Dataset, key: &str) -> Result<TensorData, WeightReadError> {
    let dtype = weight_dtype(dataset.datatype())
        .ok_or_else(|| LoadError::UnsupportedWeight { name: key.to_string(), dtype: dataset.datatype().describe() })?;
    let raw = dataset.read_raw()?;
    let data = TensorData::from_raw(dtype, Shape::from(dataset.shape()), &raw).map_err(LoadError::Weight)?;
    Ok(data)
}

/// Declared shape of an input layer: `batch_input_shape` (TF2) or `batch_shape` (Keras 3).
fn declared_shape(layer: &LayerConfig) -> Option<Vec<Option<usize>>> {
    let shape = layer.config.get("batch_input_shape").or_else(|| layer.config.get("batch_shape"))?;
    shape.as_array()?.iter().map(|d| if d.is_null() { Some(None) } else { d.as_u64().map(|d| Some(d as usize)) }).collect()
}

fn declared_dtype(layer: &LayerConfig) -> String {
    layer.config.get("dtype").and_then(compute_dtype).unwrap_or_else(|| "float32".to_string())
}

fn input_from_layer(layer: &LayerConfig, name: String) -> Option<ModelInput> {
    Some(ModelInput { name, shape: declared_shape(layer)?, dtype: declared_dtype(layer) })
}

/// The model's declared inputs, in order. A model that was never built has none.
pub(crate) fn model_inputs(config: &ModelConfig) -> Result<Vec<ModelInput>, LoadError> {
    match config.kind {
        ModelKind::Sequential => {
            let Some(first) = config.layers.first() else {
                return Ok(vec![]);
            };
            if first.class_name == "InputLayer" {
                return Ok(input_from_layer(first, first.name.clone()).into_iter().collect());
            }
            if first.is_model() {
                let inner = model_inputs(&ModelConfig::from_layer(first)?)?;
                return Ok(inner.into_iter().take(1).collect());
            }
            // Keras names the implicit input layer after the first layer
            Ok(input_from_layer(first, format!("{}_input", first.name)).into_iter().collect())
        }
        ModelKind::Functional => {
            let mut inputs = vec![];
            for endpoint in &config.input_layers {
                let layer = config
                    .layer(&endpoint.layer)
                    .ok_or_else(|| LoadError::InvalidConfig(format!("input layer {} is not in the model", endpoint.layer)))?;
                match input_from_layer(layer, layer.name.clone()) {
                    Some(input) => inputs.push(input),
                    None => return Err(LoadError::InvalidConfig(format!("input layer {} has no declared shape", layer.name))),
                }
            }
            Ok(inputs)
        }
    }
}

/// Parses a raw `model_config` document without opening a file.
pub fn inputs_from_config_json(text: &str) -> Result<Vec<ModelInput>, LoadError> {
    model_inputs(&ModelConfig::from_json(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequential_without_input_layer_uses_first_layer_shape() {
        let text = json!({
            "class_name": "Sequential",
            "config": {"name": "seq", "layers": [
                {"class_name": "Dense", "config": {"name": "dense", "units": 2, "batch_input_shape": [null, 5], "dtype": "float32"}}
            ]}
        })
        .to_string();
        let inputs = inputs_from_config_json(&text).unwrap();
        assert_eq!(inputs, vec![ModelInput { name: "dense_input".to_string(), shape: vec![None, Some(5)], dtype: "float32".to_string() }]);
    }

    #[test]
    fn unbuilt_sequential_has_no_inputs() {
        let text = json!({"class_name": "Sequential", "config": {"name": "seq", "layers": [
            {"class_name": "Dense", "config": {"name": "dense", "units": 2}}
        ]}})
        .to_string();
        assert!(inputs_from_config_json(&text).unwrap().is_empty());
    }

    #[test]
    fn functional_inputs_follow_input_layers_order() {
        let text = json!({
            "class_name": "Functional",
            "config": {
                "name": "m",
                "layers": [
                    {"class_name": "InputLayer", "name": "a", "config": {"name": "a", "batch_input_shape": [null, 2], "dtype": "int64"}, "inbound_nodes": []},
                    {"class_name": "InputLayer", "name": "b", "config": {"name": "b", "batch_shape": [1, 3], "dtype": "float32"}, "inbound_nodes": []}
                ],
                "input_layers": [["b", 0, 0], ["a", 0, 0]],
                "output_layers": [["b", 0, 0]]
            }
        })
        .to_string();
        let inputs = inputs_from_config_json(&text).unwrap();
        assert_eq!(inputs[0].name, "b");
        assert_eq!(inputs[0].shape, vec![Some(1), Some(3)]);
        assert_eq!(inputs[1].dtype, "int64");
    }

    #[test]
    fn corrupt_files_fail_without_panicking() {
        use crate::fixtures::{filled, input_layer, layer, ramp, sequential, KerasFileBuilder};

        let config = sequential("seq", vec![input_layer("x", &[None, Some(3)], "float32"), layer("Dense", "dense", json!({"units": 2}))]);
        let bytes = KerasFileBuilder::new(config)
            .layer_weights("dense", vec![("kernel", ramp(&[3, 2])), ("bias", filled(&[2], 0.0))])
            .build()
            .unwrap();
        let try_load = |data: Vec<u8>| {
            std::panic::catch_unwind(move || match hdf5::File::from_bytes(data) {
                Ok(file) => load_file(&file, Path::new("corrupt.h5")).is_ok(),
                Err(_) => false,
            })
        };
        assert_eq!(try_load(bytes.clone()).ok(), Some(true));

        let mut panicked = vec![];
        for len in (0..bytes.len()).step_by(61) {
            if try_load(bytes[..len].to_vec()).is_err() {
                panicked.push(format!("truncated to {}", len));
            }
        }
        for at in 0..bytes.len() {
            for value in [0x00, 0xff] {
                let mut data = bytes.clone();
                data[at] = value;
                if try_load(data).is_err() {
                    panicked.push(format!("byte {} set to {:#04x}", at, value));
                }
            }
        }
        assert!(panicked.is_empty(), "{:?}", panicked);
    }
}
