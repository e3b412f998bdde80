pub mod hdf5;
pub mod keras;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

use std::path::PathBuf;

pub use keras::convert::{convert, ConversionMetadata, ConvertOptions};
pub use keras::model::{load, KerasModel, ModelInput};
pub use keras::signature::{derive_signature, InputSignature};
pub use keras::supported_layers;

/// Failure to read a saved Keras model.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("No file or directory found at {}", .0.display())]
    Missing(PathBuf),
    #[error("Unable to read {}: {source}", path.display())]
    Hdf5 {
        path: PathBuf,
        #[source]
        source: hdf5::H5Error,
    },
    #[error("{} is not a saved Keras model: {reason}", path.display())]
    NotAKerasModel { path: PathBuf, reason: String },
    #[error("Invalid model config: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("Invalid model config: {0}")]
    InvalidConfig(String),
    #[error("Weight {name} has unsupported type {dtype}")]
    UnsupportedWeight { name: String, dtype: String },
    #[error("Weight data error: {0}")]
    Weight(#[from] onnx_graph::Error),
}

/// Failure to translate a loaded model into an ONNX graph.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Model has no inputs")]
    NoModelInputs,
    #[error("Input {name} has dtype {dtype}, which cannot be represented in ONNX")]
    UnsupportedDType { name: String, dtype: String },
    #[error("Input signature does not match the model: {0}")]
    SignatureMismatch(String),
    #[error("Unsupported opset {0}, expected {min}..={max}", min = onnx_graph::MIN_OPSET, max = onnx_graph::MAX_OPSET)]
    UnsupportedOpset(i64),
    #[error("Layer {layer} of type {class} is not supported")]
    UnsupportedLayer { layer: String, class: String },
    #[error("Missing config entry {key} for layer {layer}")]
    MissingConfigEntry { layer: String, key: String },
    #[error("Invalid config for layer {layer}: {message}")]
    InvalidLayerConfig { layer: String, message: String },
    #[error("Cannot resolve model graph: {0}")]
    Unresolvable(String),
    #[error("Layer {layer}: {source}")]
    Layer {
        layer: String,
        #[source]
        source: onnx_graph::Error,
    },
    #[error("Graph export failed: {0}")]
    Graph(#[from] onnx_graph::Error),
}
