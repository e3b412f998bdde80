use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use onnx_graph::{build_proto, keras, BuildOptions};
use onnx_graph::onnx::ModelProto;
use onnx_graph::tensor::{Dimension, InputTensor, Shape, Tensor};
use onnx_graph::weights::{ExternalData, InMemoryWeightManager, WeightManager, WeightStorageStrategy};
use crate::keras::config::{LayerConfig, ModelConfig, ModelKind, TensorRef};
use crate::keras::layers::{self, LayerClass, LayerContext};
use crate::keras::model::KerasModel;
use crate::keras::signature::InputSignature;
use crate::ConversionError;

pub const PRODUCER_NAME: &str = "keras2onnx";

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub opset: i64,
    pub weight_storage: WeightStorageStrategy,
    /// Write `value_info` entries for intermediate tensors.
    pub emit_value_info: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self { opset: onnx_graph::MIN_OPSET, weight_storage: WeightStorageStrategy::EmbeddedData, emit_value_info: false }
    }
}

/// Summary of an exported graph.
#[derive(Clone, Debug)]
pub struct ConversionMetadata {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub node_count: usize,
    pub initializer_count: usize,
    pub opset: i64,
    /// Initializer bytes to be written beside the model, when stored externally.
    pub external_data: Option<ExternalData>,
}

struct Layouts {
    name: String,
    channels_last: OnceCell<Arc<dyn Tensor>>,
    channels_first: OnceCell<Arc<dyn Tensor>>,
}

/// A Keras tensor and, for spatial tensors, its channels-first twin.
///
/// Keras keeps channels on the last axis while ONNX convolutions and pooling want them on
/// axis 1. Each form is built on first request and cached, so a chain of spatial layers
/// stays channels-first and only transposes back where a layer needs the Keras layout.
/// Tensors of rank below 3 have a single layout.
#[derive(Clone)]
pub(crate) struct KerasTensor(Rc<Layouts>);

impl KerasTensor {
    fn with(name: &str, channels_last: Option<Arc<dyn Tensor>>, channels_first: Option<Arc<dyn Tensor>>) -> Self {
        let layouts = Layouts { name: name.to_string(), channels_last: OnceCell::new(), channels_first: OnceCell::new() };
        if let Some(tensor) = channels_last {
            let _ = layouts.channels_last.set(tensor);
        }
        if let Some(tensor) = channels_first {
            let _ = layouts.channels_first.set(tensor);
        }
        Self(Rc::new(layouts))
    }

    /// Wraps a tensor laid out the way Keras sees it.
    pub(crate) fn new(name: &str, tensor: Arc<dyn Tensor>) -> Self {
        if tensor.rank() < 3 {
            Self::with(name, Some(tensor.clone()), Some(tensor))
        } else {
            Self::with(name, Some(tensor), None)
        }
    }

    /// Wraps a channels-first tensor whose Keras counterpart is channels-last.
    pub(crate) fn from_channels_first(name: &str, tensor: Arc<dyn Tensor>) -> Self {
        if tensor.rank() < 3 {
            Self::with(name, Some(tensor.clone()), Some(tensor))
        } else {
            Self::with(name, None, Some(tensor))
        }
    }

    fn any(&self) -> Option<&Arc<dyn Tensor>> {
        self.0.channels_last.get().or_else(|| self.0.channels_first.get())
    }

    pub(crate) fn rank(&self) -> usize {
        self.any().map(|t| t.rank()).unwrap_or_default()
    }

    pub(crate) fn has_channels_first(&self) -> bool {
        self.0.channels_first.get().is_some()
    }

    /// The tensor in Keras layout.
    pub(crate) fn keras(&self) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        if let Some(tensor) = self.0.channels_last.get() {
            return Ok(tensor.clone());
        }
        let source = self.0.channels_first.get().ok_or(onnx_graph::Error::CannotResolveDataError("keras tensor"))?;
        let perm = keras::to_channels_last_perm(source.rank());
        let tensor = keras::transpose(Some(format!("{}/ToChannelsLast", self.0.name)), source.clone(), perm)?;
        Ok(self.0.channels_last.get_or_init(|| tensor).clone())
    }

    /// The tensor with channels moved to axis 1.
    pub(crate) fn channels_first(&self) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        if let Some(tensor) = self.0.channels_first.get() {
            return Ok(tensor.clone());
        }
        let source = self.0.channels_last.get().ok_or(onnx_graph::Error::CannotResolveDataError("keras tensor"))?;
        let perm = keras::to_channels_first_perm(source.rank());
        let tensor = keras::transpose(Some(format!("{}/ToChannelsFirst", self.0.name)), source.clone(), perm)?;
        Ok(self.0.channels_first.get_or_init(|| tensor).clone())
    }

    /// Applies an elementwise op in whichever layout already exists, preferring channels-first.
    pub(crate) fn map<F>(&self, name: &str, f: F) -> Result<KerasTensor, onnx_graph::Error>
    where
        F: FnOnce(Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error>,
    {
        if self.rank() >= 3 {
            if let Some(tensor) = self.0.channels_first.get() {
                return Ok(KerasTensor::from_channels_first(name, f(tensor.clone())?));
            }
        }
        Ok(KerasTensor::new(name, f(self.keras()?)?))
    }
}

/// Where a (possibly nested) model's layers find their weights and name their nodes.
struct Scope {
    weights: InMemoryWeightManager,
    prefix: Option<String>,
}

impl Scope {
    fn node_name(&self, layer: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, layer),
            None => layer.to_string(),
        }
    }

    fn nested(&self, layer: &str) -> Scope {
        Scope { weights: self.weights.prefix(layer), prefix: Some(self.node_name(layer)) }
    }
}

struct Converter {
    keras3: bool,
}

impl Converter {
    fn convert_model(&self, config: &ModelConfig, scope: &Scope, inputs: Vec<KerasTensor>) -> Result<Vec<(String, KerasTensor)>, ConversionError> {
        match config.kind {
            ModelKind::Sequential => self.convert_sequential(config, scope, inputs),
            ModelKind::Functional => self.convert_functional(config, scope, inputs),
        }
    }

    fn convert_sequential(&self, config: &ModelConfig, scope: &Scope, inputs: Vec<KerasTensor>) -> Result<Vec<(String, KerasTensor)>, ConversionError> {
        let mut current = inputs
            .into_iter()
            .next()
            .ok_or_else(|| ConversionError::Unresolvable(format!("sequential model {} received no input", config.name)))?;
        let mut output_name = config.name.clone();
        for layer in &config.layers {
            if layer.class_name == "InputLayer" {
                output_name = layer.name.clone();
                continue;
            }
            let mut outputs = self.convert_layer(scope, layer, vec![current])?;
            if outputs.len() != 1 {
                return Err(ConversionError::Unresolvable(format!("layer {} in sequential model {} must have exactly one output", layer.name, config.name)));
            }
            current = outputs.remove(0);
            output_name = layer.name.clone();
        }
        Ok(vec![(output_name, current)])
    }

    fn convert_functional(&self, config: &ModelConfig, scope: &Scope, inputs: Vec<KerasTensor>) -> Result<Vec<(String, KerasTensor)>, ConversionError> {
        if inputs.len() != config.input_layers.len() {
            return Err(ConversionError::Unresolvable(format!(
                "model {} expects {} inputs, got {}",
                config.name,
                config.input_layers.len(),
                inputs.len()
            )));
        }
        let mut available: HashMap<TensorRef, KerasTensor> = config.input_layers.iter().cloned().zip(inputs).collect();

        let mut pending: Vec<(&LayerConfig, usize, &Vec<TensorRef>)> = vec![];
        for layer in &config.layers {
            if layer.class_name == "InputLayer" {
                continue;
            }
            for (node_index, inbound) in layer.inbound_nodes.iter().enumerate() {
                pending.push((layer, node_index, inbound));
            }
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = vec![];
            for (layer, node_index, inbound) in pending {
                let Some(args) = inbound.iter().map(|r| available.get(r).cloned()).collect::<Option<Vec<_>>>() else {
                    waiting.push((layer, node_index, inbound));
                    continue;
                };
                let outputs = self.convert_layer(scope, layer, args)?;
                for (tensor_index, tensor) in outputs.into_iter().enumerate() {
                    available.insert(TensorRef { layer: layer.name.clone(), node_index, tensor_index }, tensor);
                }
            }
            if waiting.len() == before {
                let names: Vec<&str> = waiting.iter().map(|(layer, _, _)| layer.name.as_str()).collect();
                return Err(ConversionError::Unresolvable(format!(
                    "layers {} in model {} depend on tensors that are never produced",
                    names.join(", "),
                    config.name
                )));
            }
            pending = waiting;
        }

        config
            .output_layers
            .iter()
            .map(|r| match available.get(r) {
                Some(tensor) => Ok((r.layer.clone(), tensor.clone())),
                None => Err(ConversionError::Unresolvable(format!("output {}:{}:{} of model {} is never produced", r.layer, r.node_index, r.tensor_index, config.name))),
            })
            .collect()
    }

    fn convert_layer(&self, scope: &Scope, layer: &LayerConfig, inputs: Vec<KerasTensor>) -> Result<Vec<KerasTensor>, ConversionError> {
        if layer.is_model() {
            let config = ModelConfig::from_layer(layer)
                .map_err(|err| ConversionError::InvalidLayerConfig { layer: layer.name.clone(), message: err.to_string() })?;
            log::debug!("Entering nested model {}", layer.name);
            let outputs = self.convert_model(&config, &scope.nested(&layer.name), inputs)?;
            return Ok(outputs.into_iter().map(|(_, tensor)| tensor).collect());
        }
        let class = LayerClass::from_str(&layer.class_name)
            .map_err(|_| ConversionError::UnsupportedLayer { layer: layer.name.clone(), class: layer.class_name.clone() })?;
        log::debug!("Lowering {} ({})", layer.name, class);
        let ctx = LayerContext {
            name: scope.node_name(&layer.name),
            weights: scope.weights.prefix(&layer.name),
            params: layer.params(),
            keras3: self.keras3,
        };
        let output = layers::lower(class, &ctx, inputs).map_err(|err| match err {
            ConversionError::Graph(source) => ConversionError::Layer { layer: layer.name.clone(), source },
            other => other,
        })?;
        Ok(vec![output])
    }
}

fn check_signature(model: &KerasModel, signature: &[InputSignature]) -> Result<(), ConversionError> {
    if signature.len() != model.inputs.len() {
        return Err(ConversionError::SignatureMismatch(format!("model takes {} inputs, signature has {}", model.inputs.len(), signature.len())));
    }
    for (spec, input) in signature.iter().zip(&model.inputs) {
        if spec.shape.len() != input.shape.len() {
            return Err(ConversionError::SignatureMismatch(format!(
                "{} has rank {}, model input {} has rank {}",
                spec.name,
                spec.shape.len(),
                input.name,
                input.shape.len()
            )));
        }
        for (axis, (a, b)) in spec.shape.iter().zip(&input.shape).enumerate() {
            if let (Some(a), Some(b)) = (a, b) {
                if a != b {
                    return Err(ConversionError::SignatureMismatch(format!("{} axis {} is {}, model input {} declares {}", spec.name, axis, a, input.name, b)));
                }
            }
        }
    }
    Ok(())
}

/// Graph input for one signature entry. The leading unknown dimension is the batch; any
/// other unknown dimension gets a fresh `unk__N` parameter.
fn graph_input(spec: &InputSignature, unknown: &mut usize) -> Result<Arc<InputTensor>, ConversionError> {
    let dtype = spec.onnx_dtype()?;
    let dims = spec
        .shape
        .iter()
        .enumerate()
        .map(|(axis, dim)| match dim {
            Some(value) => Dimension::new(Some(*value), None, None),
            None if axis == 0 => Dimension::new(None, Some("batch_size".to_string()), None),
            None => {
                let name = format!("unk__{}", *unknown);
                *unknown += 1;
                Dimension::new(None, Some(name), None)
            }
        })
        .collect();
    Ok(InputTensor::new(spec.name.clone(), dtype, Shape::new(dims)))
}

fn unique_output_name(base: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{}_{}", base, i);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        i += 1;
    }
}

/// Translates a loaded model into an ONNX model whose inputs follow `signature`.
pub fn convert(model: &KerasModel, signature: &[InputSignature], options: &ConvertOptions) -> Result<(ModelProto, ConversionMetadata), ConversionError> {
    onnx_graph::ir_version_for_opset(options.opset).map_err(|_| ConversionError::UnsupportedOpset(options.opset))?;
    if signature.is_empty() {
        return Err(ConversionError::NoModelInputs);
    }
    check_signature(model, signature)?;

    let mut unknown = 0;
    let mut graph_inputs = vec![];
    let mut keras_inputs = vec![];
    for spec in signature {
        let input = graph_input(spec, &mut unknown)?;
        keras_inputs.push(KerasTensor::new(&spec.name, input.clone()));
        graph_inputs.push(input);
    }

    let converter = Converter { keras3: model.is_keras3() };
    let scope = Scope { weights: model.weights.clone(), prefix: None };
    let outputs = converter.convert_model(&model.config, &scope, keras_inputs)?;

    let mut taken: HashSet<String> = signature.iter().map(|spec| spec.name.clone()).collect();
    let mut graph_outputs = vec![];
    for (name, tensor) in outputs {
        let name = unique_output_name(&name, &mut taken);
        graph_outputs.push((name, tensor.keras()?));
    }

    let mut metadata = vec![];
    if let Some(version) = &model.keras_version {
        metadata.push(("keras_version".to_string(), version.clone()));
    }
    if let Some(backend) = &model.backend {
        metadata.push(("backend".to_string(), backend.clone()));
    }
    let build_options = BuildOptions {
        opset: options.opset,
        graph_name: model.name().to_string(),
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        doc_string: String::new(),
        metadata,
        weight_storage: options.weight_storage.clone(),
        emit_value_info: options.emit_value_info,
    };
    let built = build_proto(&graph_inputs, &graph_outputs, &build_options)?;

    let (node_count, initializer_count) = built.proto.graph.as_ref().map(|g| (g.node.len(), g.initializer.len())).unwrap_or_default();
    let metadata = ConversionMetadata {
        input_names: signature.iter().map(|spec| spec.name.clone()).collect(),
        output_names: graph_outputs.into_iter().map(|(name, _)| name).collect(),
        node_count,
        initializer_count,
        opset: options.opset,
        external_data: built.external_data,
    };
    log::info!(
        "Converted {} into {} nodes and {} initializers (opset {})",
        model.name(),
        metadata.node_count,
        metadata.initializer_count,
        metadata.opset
    );
    Ok((built.proto, metadata))
}
