pub mod operators;
pub mod weights;
pub mod tensor;
pub mod node;
pub mod keras;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tensor::*;
use node::*;
use crate::operators::Identity;
use crate::weights::{new_output_manager, ExternalData, WeightStorageStrategy};

pub mod onnx {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

pub use tensor::DType;

/// Lowest default-domain opset the operators here are written against.
pub const MIN_OPSET: i64 = 13;
/// Highest default-domain opset accepted for export.
pub const MAX_OPSET: i64 = 21;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shape error: {0}")]
    InputShapeError(String),
    #[error("DType mismatch: {0} vs {1}")]
    DTypeMismatchError(DType, DType),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error("Unsupported dtype: {0}")]
    UnsupportedDTypeError(String),
    #[error("Tensor name conflict: {0}")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension could not be resolved to a static size")]
    UnresolvedDimensionError,
    #[error("Invalid dtype {0} for {1}")]
    InvalidDTypeError(DType, &'static str),
    #[error("Cannot resolve constant data for {0}")]
    CannotResolveDataError(&'static str),
    #[error("Unsupported activation: {0}")]
    UnsupportedActivationError(String),
    #[error("Unsupported opset {0}, expected {MIN_OPSET}..={MAX_OPSET}")]
    UnsupportedOpsetError(i64),
}

fn validate_elementwise_inputs(inputs: &[Arc<dyn Tensor>]) -> Result<Shape, Error> {
    let mut shape = inputs[0].shape().clone();
    for input in inputs {
        if input.dtype() != inputs[0].dtype() {
            return Err(Error::DTypeMismatchError(inputs[0].dtype(), input.dtype()));
        }
        shape = shape.broadcast(input.shape())?;
    };
    Ok(shape)
}

/// IR version paired with each opset release.
pub fn ir_version_for_opset(opset: i64) -> Result<i64, Error> {
    let version = match opset {
        13 | 14 => onnx::Version::IrVersion202058,
        15..=18 => onnx::Version::IrVersion2021730,
        19 | 20 => onnx::Version::IrVersion202355,
        21 => onnx::Version::IrVersion2024325,
        _ => return Err(Error::UnsupportedOpsetError(opset)),
    };
    Ok(version as i64)
}

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub opset: i64,
    pub graph_name: String,
    pub producer_name: String,
    pub producer_version: String,
    pub doc_string: String,
    pub metadata: Vec<(String, String)>,
    pub weight_storage: WeightStorageStrategy,
    pub emit_value_info: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            opset: MIN_OPSET,
            graph_name: String::new(),
            producer_name: "onnx-graph".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            doc_string: String::new(),
            metadata: vec![],
            weight_storage: WeightStorageStrategy::EmbeddedData,
            emit_value_info: false,
        }
    }
}

pub struct BuiltModel {
    pub proto: onnx::ModelProto,
    pub external_data: Option<ExternalData>,
}

/// Depth-first post-order walk from the graph outputs.
///
/// Produces nodes in topological order and tensors in first-use order. Both only depend on
/// how the graph was constructed, so repeated exports are byte-identical.
struct GraphWalk<'a> {
    tensors: Vec<&'a dyn Tensor>,
    nodes: Vec<&'a dyn Node>,
    seen: HashSet<&'a dyn Tensor>,
}

impl<'a> GraphWalk<'a> {
    fn new() -> Self {
        Self { tensors: vec![], nodes: vec![], seen: HashSet::new() }
    }

    fn visit(&mut self, root: &'a dyn Tensor) {
        let mut stack: Vec<(&'a dyn Tensor, bool)> = vec![(root, false)];
        while let Some((tensor, expanded)) = stack.pop() {
            if expanded {
                if let Some(node) = tensor.get_node() {
                    self.nodes.push(node);
                }
                self.tensors.push(tensor);
                continue;
            }
            if !self.seen.insert(tensor) {
                continue;
            }
            stack.push((tensor, true));
            if let Some(node) = tensor.get_node() {
                for input in node.get_input_tensors().into_iter().rev() {
                    if !self.seen.contains(&input) {
                        stack.push((input, false));
                    }
                }
            }
        }
    }
}

fn unique_name(base: &str, chosen: &mut HashSet<String>) -> String {
    if chosen.insert(base.to_string()) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{}_{}", base, i);
        if chosen.insert(candidate.clone()) {
            return candidate;
        }
        i += 1;
    }
}

pub fn build_proto(
    inputs: &[Arc<InputTensor>],
    outputs: &[(String, Arc<dyn Tensor>)],
    options: &BuildOptions,
) -> Result<BuiltModel, Error> {
    let ir_version = ir_version_for_opset(options.opset)?;

    // Graph outputs must be produced by a node and may only be named once
    let mut output_tensors: Vec<(String, Arc<dyn Tensor>)> = vec![];
    {
        let mut claimed: HashSet<&dyn Tensor> = HashSet::new();
        for (name, tensor) in outputs {
            let needs_identity = tensor.get_node().is_none() || !claimed.insert(tensor.as_ref());
            let tensor: Arc<dyn Tensor> = if needs_identity {
                Identity::new(Some(format!("{}/Identity", name)), tensor.clone()) as Arc<dyn Tensor>
            } else {
                tensor.clone()
            };
            output_tensors.push((name.clone(), tensor));
        }
    }

    let mut walk = GraphWalk::new();
    for (_, tensor) in &output_tensors {
        walk.visit(tensor.as_ref());
    }

    // Inputs and outputs keep exactly the requested names
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();
    for input in inputs {
        let tensor = input.as_ref() as &dyn Tensor;
        let name = tensor.get_name().unwrap_or_default().to_string();
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name));
        }
        tensor_names.insert(tensor, name);
    }
    for (name, tensor) in &output_tensors {
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name.clone()));
        }
        tensor_names.insert(tensor.as_ref(), name.clone());
    }

    // Every other tensor gets its requested name or a generated one
    let mut next_tensor_id = 0;
    for tensor in &walk.tensors {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        if tensor.is_input() {
            return Err(Error::InvalidInputError(format!(
                "graph input {} is not listed in the model inputs",
                tensor.get_name().unwrap_or("<unnamed>")
            )));
        }
        let name = match tensor.get_name() {
            Some(name) => unique_name(name, &mut chosen_names),
            None => loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if chosen_names.insert(name.clone()) {
                    break name;
                }
            }
        };
        tensor_names.insert(*tensor, name);
    }

    let mut node_names: HashSet<String> = HashSet::new();
    let mut nodes = vec![];
    for node in &walk.nodes {
        let name = node.get_name().map(|name| unique_name(name, &mut node_names));
        nodes.push(node.to_node_proto(name, &tensor_names));
    }

    let mut data_manager = new_output_manager(&options.weight_storage);
    let mut initializers = vec![];
    for tensor in &walk.tensors {
        if let Some(initializer) = tensor.get_initializer(tensor_names[tensor].clone(), data_manager.as_mut())? {
            initializers.push(initializer);
        }
    }
    let external_data = data_manager.finalize_tensor_data();

    let value_info = if options.emit_value_info {
        walk.tensors.iter()
            .filter(|tensor| tensor.get_node().is_some())
            .filter(|tensor| !output_tensors.iter().any(|(_, t)| t.as_ref() == **tensor))
            .map(|tensor| tensor.to_value_info_proto(tensor_names[tensor].clone()))
            .collect()
    } else {
        vec![]
    };

    log::debug!("Exporting graph with {} nodes and {} initializers", nodes.len(), initializers.len());

    let graph = onnx::GraphProto {
        name: options.graph_name.clone(),
        node: nodes,
        initializer: initializers,
        doc_string: String::new(),
        input: inputs.iter().map(|tensor| tensor.to_value_info_proto(tensor_names[&(tensor.as_ref() as &dyn Tensor)].clone())).collect(),
        output: output_tensors.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        value_info,
        metadata_props: vec![],
        .. Default::default()
    };

    let proto = onnx::ModelProto {
        ir_version,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: options.opset,
        }],
        producer_name: options.producer_name.clone(),
        producer_version: options.producer_version.clone(),
        domain: String::new(),
        model_version: 0,
        doc_string: options.doc_string.clone(),
        graph: Some(graph),
        metadata_props: options.metadata.iter().map(|(key, value)| onnx::StringStringEntryProto {
            key: key.clone(),
            value: value.clone(),
        }).collect(),
    };
    Ok(BuiltModel { proto, external_data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Add, Relu};
    use crate::tensor::{TensorData, WeightTensor};
    use prost::Message;

    fn small_graph() -> (Arc<InputTensor>, Arc<dyn Tensor>) {
        let input = InputTensor::new("input".to_string(), DType::F32, Shape::from(vec![2usize, 3]));
        let bias = WeightTensor::new("bias".to_string(), TensorData::fill(Shape::from(vec![3usize]), 1.0f32).unwrap());
        let sum = Add::new(Some("add".to_string()), input.clone(), bias).unwrap();
        let out = Relu::new(Some("relu".to_string()), sum);
        (input, out)
    }

    #[test]
    fn nodes_are_topologically_ordered() {
        let (input, out) = small_graph();
        let built = build_proto(&[input], &[("out".to_string(), out)], &BuildOptions::default()).unwrap();
        let graph = built.proto.graph.unwrap();
        let ops: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Add", "Relu"]);
        assert_eq!(graph.node[0].input, vec!["input".to_string(), "bias".to_string()]);
        assert_eq!(graph.node[1].output, vec!["out".to_string()]);
        assert_eq!(graph.initializer.len(), 1);
        assert_eq!(built.proto.opset_import[0].version, 13);
        assert_eq!(built.proto.ir_version, 7);
    }

    #[test]
    fn export_is_deterministic() {
        let encode = || {
            let (input, out) = small_graph();
            build_proto(&[input], &[("out".to_string(), out)], &BuildOptions::default()).unwrap().proto.encode_to_vec()
        };
        assert_eq!(encode(), encode());
    }

    #[test]
    fn input_passed_straight_through_gets_identity() {
        let input = InputTensor::new("input".to_string(), DType::F32, Shape::from(vec![4usize]));
        let built = build_proto(&[input.clone()], &[("output".to_string(), input as Arc<dyn Tensor>)], &BuildOptions::default()).unwrap();
        let graph = built.proto.graph.unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type, "Identity");
        assert_eq!(graph.node[0].input, vec!["input".to_string()]);
    }

    #[test]
    fn rejects_opset_out_of_range() {
        let (input, out) = small_graph();
        let options = BuildOptions { opset: 7, ..BuildOptions::default() };
        assert!(matches!(build_proto(&[input], &[("out".to_string(), out)], &options), Err(Error::UnsupportedOpsetError(7))));
    }

    #[test]
    fn external_weights_are_collected() {
        let (input, out) = small_graph();
        let options = BuildOptions {
            weight_storage: WeightStorageStrategy::BinFile { location: "model.onnx.data".to_string() },
            ..BuildOptions::default()
        };
        let built = build_proto(&[input], &[("out".to_string(), out)], &options).unwrap();
        let blob = built.external_data.unwrap();
        assert_eq!(blob.bytes.len(), 12);
        let init = &built.proto.graph.unwrap().initializer[0];
        assert_eq!(init.data_location, onnx::tensor_proto::DataLocation::External as i32);
    }
}
