use std::collections::HashMap;
use std::sync::Arc;
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{Tensor, TensorData, WeightTensor};

/// Where initializer bytes end up in the exported model.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightStorageStrategy {
    /// Raw bytes inline in each initializer.
    #[default]
    EmbeddedData,
    /// One external blob, referenced by file name relative to the model.
    BinFile { location: String },
}

/// The external weight blob produced by [`WeightStorageStrategy::BinFile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalData {
    pub location: String,
    pub bytes: Vec<u8>,
}

pub trait WeightOutputManager {
    fn get_initializer(&mut self, tensor_name: String, data: &TensorData) -> Result<TensorProto, Error>;
    fn finalize_tensor_data(&mut self) -> Option<ExternalData> {
        None
    }
}

pub(crate) fn new_output_manager(strategy: &WeightStorageStrategy) -> Box<dyn WeightOutputManager> {
    match strategy {
        WeightStorageStrategy::EmbeddedData => Box::new(EmbeddedOutputManager::new()),
        WeightStorageStrategy::BinFile { location } => Box::new(BinOutputManager::new(location.clone())),
    }
}

pub struct EmbeddedOutputManager {}

impl EmbeddedOutputManager {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for EmbeddedOutputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightOutputManager for EmbeddedOutputManager {
    fn get_initializer(&mut self, tensor_name: String, data: &TensorData) -> Result<TensorProto, Error> {
        data.to_tensor_data_proto(Some(tensor_name))
    }
}

pub struct BinOutputManager {
    location: String,
    output: Vec<u8>,
}

impl BinOutputManager {
    pub fn new(location: String) -> Self {
        Self {
            location,
            output: Vec::new(),
        }
    }
}

impl WeightOutputManager for BinOutputManager {
    fn get_initializer(&mut self, tensor_name: String, data: &TensorData) -> Result<TensorProto, Error> {
        let byte_offset = self.output.len();
        let bytes = data.to_raw_encoding();
        let byte_len = bytes.len();
        self.output.extend_from_slice(&bytes);
        Ok(TensorProto {
            name: tensor_name,
            data_type: onnx::tensor_proto::DataType::from(data.dtype()) as i32,
            dims: data.shape().resolve()?.iter().map(|x| *x as i64).collect(),
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![
                onnx::StringStringEntryProto {
                    key: "location".to_string(),
                    value: self.location.clone(),
                },
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: format!("{byte_offset}"),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: format!("{byte_len}"),
                }
            ],
            .. Default::default()
        })
    }

    fn finalize_tensor_data(&mut self) -> Option<ExternalData> {
        Some(ExternalData {
            location: self.location.clone(),
            bytes: std::mem::take(&mut self.output),
        })
    }
}

pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error>;
    fn has_tensor(&self, name: &str) -> bool {
        self.get_tensor_data(name).is_ok()
    }
    fn get_prefix(&self) -> Option<&str>;
}

/// Weights already decoded into host memory, keyed by `scope/name`.
///
/// Lookups try the exact key first and then any key that ends with `/scope/name`, which is
/// how weights saved under an enclosing model's scope are found.
#[derive(Clone)]
pub struct InMemoryWeightManager {
    prefix: Option<String>,
    tensors: Arc<HashMap<String, TensorData>>
}

impl InMemoryWeightManager {
    pub fn new(tensors: HashMap<String, TensorData>) -> Self {
        Self {
            prefix: None,
            tensors: Arc::new(tensors)
        }
    }

    fn full_name(&self, name: &str) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}/{}", prefix, name)
        } else {
            name.to_string()
        }
    }

    fn resolve_key(&self, name: &str) -> Result<&str, Error> {
        let full_name = self.full_name(name);
        if let Some((key, _)) = self.tensors.get_key_value(&full_name) {
            return Ok(key.as_str());
        }
        let suffix = format!("/{}", full_name);
        let mut matches: Vec<&str> = self.tensors.keys().map(|key| key.as_str()).filter(|key| key.ends_with(&suffix)).collect();
        matches.sort();
        // Entries saved under the layer's own group win over ones from other scopes.
        let scope = format!("{}/", full_name.split('/').next().unwrap_or_default());
        if matches.iter().any(|key| key.starts_with(&scope)) {
            matches.retain(|key| key.starts_with(&scope));
        }
        match matches.as_slice() {
            [] => Err(Error::NoSuchTensorError(full_name)),
            [key] => Ok(*key),
            [key, ..] => {
                log::warn!("Weight {} matches {} scoped entries, using {}", full_name, matches.len(), key);
                Ok(*key)
            }
        }
    }
}

impl WeightManager for InMemoryWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(self.full_name(name)),
            tensors: self.tensors.clone()
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let key = self.resolve_key(name)?;
        Ok(WeightTensor::new(key.to_string(), self.tensors[key].clone()))
    }

    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error> {
        let key = self.resolve_key(name)?;
        Ok(self.tensors[key].clone())
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}
