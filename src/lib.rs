//! Converts a Keras model saved as HDF5 into an ONNX model file.

use std::io::Write;
use std::path::{Path, PathBuf};
use prost::Message;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use keras2onnx_import::{ConversionError, ConversionMetadata, ConvertOptions, InputSignature, KerasModel, LoadError};
use onnx_graph::weights::{ExternalData, WeightStorageStrategy};

/// Settings for one conversion. Every field has a default, so a config file only needs the
/// entries it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Saved Keras model to read.
    pub source_path: PathBuf,
    /// Destination of the ONNX model; replaced if it exists.
    pub output_path: PathBuf,
    /// Default-domain opset of the exported graph.
    pub target_opset: i64,
    /// Name of the first graph input.
    pub input_name: String,
    /// Inline initializers, or one external blob beside the model.
    pub weight_storage: WeightStorageStrategy,
    /// Record shapes of intermediate tensors in the graph.
    pub emit_value_info: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("keras_model.h5"),
            output_path: PathBuf::from("model.onnx"),
            target_opset: 13,
            input_name: "input".to_string(),
            weight_storage: WeightStorageStrategy::EmbeddedData,
            emit_value_info: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConverterConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("Cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A serialized ONNX model, ready to be written.
pub struct ConvertedModel {
    pub bytes: Vec<u8>,
    pub external_data: Option<ExternalData>,
    pub metadata: ConversionMetadata,
}

#[derive(Clone, Debug)]
pub struct ConversionReport {
    pub output_path: PathBuf,
    pub metadata: ConversionMetadata,
}

/// Hooks called between the steps of [`ModelConverter::run_observed`].
pub trait ConversionObserver {
    fn model_loaded(&mut self, _model: &KerasModel) {}
    fn model_written(&mut self, _report: &ConversionReport) {}
}

impl ConversionObserver for () {}

pub struct ModelConverter {
    config: ConverterConfig,
}

impl ModelConverter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn load(&self) -> Result<KerasModel, ConvertError> {
        log::info!("Loading {}", self.config.source_path.display());
        Ok(keras2onnx_import::load(&self.config.source_path)?)
    }

    pub fn derive_signature(&self, model: &KerasModel) -> Result<Vec<InputSignature>, ConvertError> {
        let signature = keras2onnx_import::derive_signature(model, &self.config.input_name)?;
        for input in &signature {
            log::debug!("Input {} {:?} {}", input.name, input.shape, input.dtype);
        }
        Ok(signature)
    }

    pub fn convert(&self, model: &KerasModel, signature: &[InputSignature]) -> Result<ConvertedModel, ConvertError> {
        let options = ConvertOptions {
            opset: self.config.target_opset,
            weight_storage: self.config.weight_storage.clone(),
            emit_value_info: self.config.emit_value_info,
        };
        let (proto, mut metadata) = keras2onnx_import::convert(model, signature, &options)?;
        let external_data = metadata.external_data.take();
        Ok(ConvertedModel { bytes: proto.encode_to_vec(), external_data, metadata })
    }

    /// Writes the model (and its external blob, first) so that each destination either keeps
    /// its previous content or holds the complete new file.
    pub fn write(&self, model: &ConvertedModel) -> Result<PathBuf, ConvertError> {
        let output = &self.config.output_path;
        if let Some(external) = &model.external_data {
            let blob = destination_dir(output).join(&external.location);
            persist_atomically(&blob, &external.bytes)?;
            log::info!("Wrote {} bytes of weights to {}", external.bytes.len(), blob.display());
        }
        persist_atomically(output, &model.bytes)?;
        log::info!("Wrote {} bytes to {}", model.bytes.len(), output.display());
        Ok(output.clone())
    }

    pub fn run(&self) -> Result<ConversionReport, ConvertError> {
        self.run_observed(&mut ())
    }

    pub fn run_observed(&self, observer: &mut impl ConversionObserver) -> Result<ConversionReport, ConvertError> {
        let model = self.load()?;
        observer.model_loaded(&model);
        let signature = self.derive_signature(&model)?;
        let converted = self.convert(&model, &signature)?;
        let output_path = self.write(&converted)?;
        let report = ConversionReport { output_path, metadata: converted.metadata };
        observer.model_written(&report);
        Ok(report)
    }
}

fn destination_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<(), ConvertError> {
    let write_error = |source: std::io::Error| ConvertError::Write { path: path.to_path_buf(), source };
    let mut file = NamedTempFile::new_in(destination_dir(path)).map_err(write_error)?;
    file.write_all(bytes).map_err(write_error)?;
    file.as_file().sync_all().map_err(write_error)?;
    file.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_fixed_paths() {
        let config = ConverterConfig::default();
        assert_eq!(config.source_path, PathBuf::from("keras_model.h5"));
        assert_eq!(config.output_path, PathBuf::from("model.onnx"));
        assert_eq!(config.target_opset, 13);
        assert_eq!(config.input_name, "input");
        assert_eq!(config.weight_storage, WeightStorageStrategy::EmbeddedData);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"target_opset": 17, "weight_storage": {"kind": "bin_file", "location": "weights.bin"}}"#).unwrap();
        let config = ConverterConfig::from_json_file(&path).unwrap();
        assert_eq!(config.target_opset, 17);
        assert_eq!(config.weight_storage, WeightStorageStrategy::BinFile { location: "weights.bin".to_string() });
        assert_eq!(config.input_name, "input");
    }

    #[test]
    fn malformed_config_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ConverterConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn persist_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"old").unwrap();
        persist_atomically(&path, b"new contents").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new contents");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn persist_into_missing_directory_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("model.onnx");
        let err = persist_atomically(&path, b"bytes").unwrap_err();
        assert!(matches!(err, ConvertError::Write { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn bare_file_name_writes_to_the_working_directory() {
        assert_eq!(destination_dir(Path::new("model.onnx")), Path::new("."));
        assert_eq!(destination_dir(Path::new("out/model.onnx")), Path::new("out"));
    }
}
