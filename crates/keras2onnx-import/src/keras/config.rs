use serde::Deserialize;
use serde_json::Value;
use crate::{ConversionError, LoadError};

/// Reference to one output of one call of a layer: `(layer, node_index, tensor_index)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorRef {
    pub layer: String,
    pub node_index: usize,
    pub tensor_index: usize,
}

impl TensorRef {
    /// Parses `["name", node, tensor, ...]`.
    fn from_list(value: &Value) -> Option<Self> {
        let list = value.as_array()?;
        Some(Self {
            layer: list.first()?.as_str()?.to_string(),
            node_index: list.get(1).and_then(Value::as_u64).unwrap_or(0) as usize,
            tensor_index: list.get(2).and_then(Value::as_u64).unwrap_or(0) as usize,
        })
    }

    /// `input_layers` / `output_layers` are either a list of references or, for a single
    /// tensor, one bare reference.
    fn parse_endpoints(value: Option<&Value>) -> Result<Vec<Self>, LoadError> {
        let Some(value) = value else {
            return Ok(vec![]);
        };
        let list = value.as_array().ok_or_else(|| LoadError::InvalidConfig(format!("expected a list of layers, found {}", value)))?;
        if list.first().is_some_and(Value::is_string) {
            return Self::from_list(value).map(|r| vec![r]).ok_or_else(|| LoadError::InvalidConfig(format!("bad layer reference {}", value)));
        }
        list.iter()
            .map(|item| Self::from_list(item).ok_or_else(|| LoadError::InvalidConfig(format!("bad layer reference {}", item))))
            .collect()
    }
}

/// Collects the tensors a call consumes, in argument order.
///
/// TF2 Keras serializes a call as a list of `[layer, node, tensor, kwargs]` entries; Keras 3
/// serializes `{"args": [...], "kwargs": {...}}` with `__keras_tensor__` objects nested inside.
fn parse_inbound_node(value: &Value) -> Result<Vec<TensorRef>, LoadError> {
    fn collect_keras_tensors(value: &Value, out: &mut Vec<TensorRef>) {
        match value {
            Value::Object(map) if map.get("class_name").and_then(Value::as_str) == Some("__keras_tensor__") => {
                if let Some(r) = map.get("config").and_then(|c| c.get("keras_history")).and_then(TensorRef::from_list) {
                    out.push(r);
                }
            }
            Value::Array(items) => items.iter().for_each(|item| collect_keras_tensors(item, out)),
            _ => {}
        }
    }

    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| TensorRef::from_list(item).ok_or_else(|| LoadError::InvalidConfig(format!("bad inbound node {}", item))))
            .collect(),
        Value::Object(map) => {
            let mut refs = vec![];
            if let Some(args) = map.get("args") {
                collect_keras_tensors(args, &mut refs);
            }
            Ok(refs)
        }
        other => Err(LoadError::InvalidConfig(format!("bad inbound node {}", other))),
    }
}

#[derive(Deserialize)]
struct RawLayer {
    class_name: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    inbound_nodes: Vec<Value>,
}

/// One entry of a model's layer list.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub class_name: String,
    pub name: String,
    pub config: Value,
    /// One entry per call of the layer; empty for `Sequential` members and input layers.
    pub inbound_nodes: Vec<Vec<TensorRef>>,
}

impl LayerConfig {
    fn from_raw(raw: RawLayer) -> Result<Self, LoadError> {
        let name = raw
            .name
            .or_else(|| raw.config.get("name").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| LoadError::InvalidConfig(format!("{} layer without a name", raw.class_name)))?;
        let inbound_nodes = raw.inbound_nodes.iter().map(parse_inbound_node).collect::<Result<_, _>>()?;
        Ok(Self { class_name: raw.class_name, name, config: raw.config, inbound_nodes })
    }

    pub fn is_model(&self) -> bool {
        matches!(self.class_name.as_str(), "Sequential" | "Functional" | "Model")
    }

    pub fn params(&self) -> Params<'_> {
        Params { layer: &self.name, config: &self.config }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Sequential,
    Functional,
}

/// Architecture of a (possibly nested) Keras model.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub name: String,
    pub layers: Vec<LayerConfig>,
    pub input_layers: Vec<TensorRef>,
    pub output_layers: Vec<TensorRef>,
}

impl ModelConfig {
    /// Parses the JSON stored in the `model_config` attribute.
    pub fn from_json(text: &str) -> Result<Self, LoadError> {
        let raw: RawLayer = serde_json::from_str(text)?;
        Self::from_class(&raw.class_name, &raw.config)
    }

    /// Parses a model that appears as a layer of another model.
    pub fn from_layer(layer: &LayerConfig) -> Result<Self, LoadError> {
        Self::from_class(&layer.class_name, &layer.config)
    }

    fn from_class(class_name: &str, config: &Value) -> Result<Self, LoadError> {
        let kind = match class_name {
            "Sequential" => ModelKind::Sequential,
            "Functional" | "Model" => ModelKind::Functional,
            other => return Err(LoadError::InvalidConfig(format!("{} is not a model class", other))),
        };
        // Keras before 2.2.3 stored a Sequential config as the bare layer list
        let (layers, name) = match config {
            Value::Array(layers) => (layers.clone(), None),
            Value::Object(map) => (
                map.get("layers").and_then(Value::as_array).cloned().unwrap_or_default(),
                map.get("name").and_then(Value::as_str).map(str::to_string),
            ),
            other => return Err(LoadError::InvalidConfig(format!("bad model config {}", other))),
        };
        let layers = layers
            .into_iter()
            .map(|layer| LayerConfig::from_raw(serde_json::from_value(layer)?))
            .collect::<Result<Vec<_>, LoadError>>()?;
        let (input_layers, output_layers) = match kind {
            ModelKind::Sequential => (vec![], vec![]),
            ModelKind::Functional => (
                TensorRef::parse_endpoints(config.get("input_layers"))?,
                TensorRef::parse_endpoints(config.get("output_layers"))?,
            ),
        };
        Ok(Self {
            kind,
            name: name.unwrap_or_else(|| class_name.to_lowercase()),
            layers,
            input_layers,
            output_layers,
        })
    }

    pub fn layer(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|layer| layer.name == name)
    }
}

/// Maps a dtype entry (a plain string or a dtype-policy object) to the dtype a layer computes in.
pub fn compute_dtype(value: &Value) -> Option<String> {
    let name = match value {
        Value::String(name) => name.as_str(),
        Value::Object(map) => map.get("config").and_then(|c| c.get("name")).and_then(Value::as_str)?,
        _ => return None,
    };
    Some(match name {
        "mixed_float16" => "float16".to_string(),
        "mixed_bfloat16" => "bfloat16".to_string(),
        name => name.to_string(),
    })
}

/// Typed access to a layer's `config` object.
pub struct Params<'a> {
    layer: &'a str,
    config: &'a Value,
}

impl<'a> Params<'a> {
    fn missing(&self, key: &str) -> ConversionError {
        ConversionError::MissingConfigEntry { layer: self.layer.to_string(), key: key.to_string() }
    }

    pub fn invalid(&self, message: impl Into<String>) -> ConversionError {
        ConversionError::InvalidLayerConfig { layer: self.layer.to_string(), message: message.into() }
    }

    /// The value for `key`, treating JSON `null` as absent.
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.config.get(key).filter(|v| !v.is_null())
    }

    pub fn get_value(&self, key: &str) -> Result<&'a Value, ConversionError> {
        self.get(key).ok_or_else(|| self.missing(key))
    }

    pub fn get_usize(&self, key: &str) -> Result<usize, ConversionError> {
        self.get_value(key)?.as_u64().map(|v| v as usize).ok_or_else(|| self.invalid(format!("{} is not a non-negative integer", key)))
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> Result<i64, ConversionError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_i64().ok_or_else(|| self.invalid(format!("{} is not an integer", key))),
        }
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64, ConversionError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| self.invalid(format!("{} is not a number", key))),
        }
    }

    pub fn get_opt_f64(&self, key: &str) -> Result<Option<f64>, ConversionError> {
        self.get(key).map(|value| value.as_f64().ok_or_else(|| self.invalid(format!("{} is not a number", key)))).transpose()
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, ConversionError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_bool().ok_or_else(|| self.invalid(format!("{} is not a boolean", key))),
        }
    }

    pub fn get_str_or(&self, key: &str, default: &'a str) -> Result<&'a str, ConversionError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.as_str().ok_or_else(|| self.invalid(format!("{} is not a string", key))),
        }
    }

    pub fn get_i64_list(&self, key: &str) -> Result<Vec<i64>, ConversionError> {
        let list = self.get_value(key)?.as_array().ok_or_else(|| self.invalid(format!("{} is not a list", key)))?;
        list.iter().map(|v| v.as_i64().ok_or_else(|| self.invalid(format!("{} holds a non-integer", key)))).collect()
    }

    /// An int-or-tuple entry such as `kernel_size`, expanded to `rank` values.
    pub fn get_tuple(&self, key: &str, rank: usize) -> Result<Vec<usize>, ConversionError> {
        expand_tuple(self.get_value(key)?, rank).ok_or_else(|| self.invalid(format!("{} must be an integer or a list of {} integers", key, rank)))
    }

    pub fn get_tuple_or(&self, key: &str, rank: usize, default: usize) -> Result<Vec<usize>, ConversionError> {
        match self.get(key) {
            None => Ok(vec![default; rank]),
            Some(_) => self.get_tuple(key, rank),
        }
    }

    /// `channels_last` unless the layer says otherwise.
    pub fn channels_first(&self) -> Result<bool, ConversionError> {
        match self.get_str_or("data_format", "channels_last")? {
            "channels_last" => Ok(false),
            "channels_first" => Ok(true),
            other => Err(self.invalid(format!("unknown data_format {}", other))),
        }
    }

    pub fn activation(&self) -> Result<&'a str, ConversionError> {
        match self.get("activation") {
            None => Ok("linear"),
            Some(Value::String(name)) => Ok(name.as_str()),
            // Keras 3 may serialize builtin activations as {"class_name": "function", "config": "relu"}
            Some(Value::Object(map)) => map.get("config").and_then(Value::as_str).ok_or_else(|| self.invalid("unsupported activation object")),
            Some(other) => Err(self.invalid(format!("bad activation {}", other))),
        }
    }

    pub fn dtype(&self) -> Option<String> {
        self.get("dtype").and_then(compute_dtype)
    }
}

fn expand_tuple(value: &Value, rank: usize) -> Option<Vec<usize>> {
    match value {
        Value::Number(n) => Some(vec![n.as_u64()? as usize; rank]),
        Value::Array(items) if items.len() == rank => items.iter().map(|v| v.as_u64().map(|v| v as usize)).collect(),
        _ => None,
    }
}
