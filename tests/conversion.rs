mod common;

use std::path::Path;
use keras2onnx::{ConvertError, ConverterConfig, ModelConverter};
use keras2onnx_import::{ConversionError, LoadError};
use keras2onnx_import::hdf5::H5Error;
use keras2onnx_import::fixtures::KerasFileBuilder;
use onnx_graph::onnx;
use onnx_graph::weights::WeightStorageStrategy;
use common::*;

fn converter(dir: &Path, model: &KerasFileBuilder) -> ModelConverter {
    init_logging();
    let source = dir.join("keras_model.h5");
    model.write(&source).unwrap();
    ModelConverter::new(ConverterConfig { source_path: source, output_path: dir.join("model.onnx"), ..Default::default() })
}

#[test]
fn image_classifier_keeps_its_input_signature() {
    let dir = tempfile::tempdir().unwrap();
    let report = converter(dir.path(), &image_classifier()).run().unwrap();
    assert_eq!(report.output_path, dir.path().join("model.onnx"));

    let model = decode(&report.output_path);
    let graph = graph(&model);
    assert_eq!(graph.input.len(), 1);
    assert_eq!(graph.input[0].name, "input");
    assert_eq!(dims(&graph.input[0]), vec!["1", "224", "224", "3"]);
    assert_eq!(elem_type(&graph.input[0]), onnx::tensor_proto::DataType::Float);
    assert_eq!(graph.output[0].name, "logits");
    assert_eq!(dims(&graph.output[0]), vec!["1", "5"]);
    assert_eq!(model.opset_import[0].version, 13);
    assert_eq!(
        op_types(&model),
        vec![
            "Transpose",
            "Conv",
            "BatchNormalization",
            "Constant",
            "Constant",
            "Clip",
            "MaxPool",
            "GlobalAveragePool",
            "Flatten",
            "Gemm",
            "Softmax"
        ]
    );
    assert_eq!(report.metadata.node_count, graph.node.len());
}

#[test]
fn unknown_batch_becomes_symbolic() {
    let dir = tempfile::tempdir().unwrap();
    let report = converter(dir.path(), &tabular_model("float32")).run().unwrap();
    let model = decode(&report.output_path);
    assert_eq!(dims(&graph(&model).input[0]), vec!["batch_size", "6"]);
    assert_eq!(dims(&graph(&model).output[0]), vec!["batch_size", "1"]);
}

#[test]
fn mismatched_input_dtype_is_cast_to_the_weights() {
    let dir = tempfile::tempdir().unwrap();
    let report = converter(dir.path(), &tabular_model("float64")).run().unwrap();
    let model = decode(&report.output_path);
    assert_eq!(elem_type(&graph(&model).input[0]), onnx::tensor_proto::DataType::Double);
    assert!(op_types(&model).contains(&"Cast"));
}

#[test]
fn missing_source_writes_nothing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("model.onnx");
    let converter = ModelConverter::new(ConverterConfig { source_path: dir.path().join("keras_model.h5"), output_path: output.clone(), ..Default::default() });
    let err = converter.run().unwrap_err();
    assert!(matches!(err, ConvertError::Load(LoadError::Missing(_))));
    assert!(err.to_string().contains("keras_model.h5"));
    assert!(!output.exists());
}

#[test]
fn non_hdf5_source_writes_nothing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("keras_model.h5");
    std::fs::write(&source, NOT_HDF5).unwrap();
    let output = dir.path().join("model.onnx");
    let err = ModelConverter::new(ConverterConfig { source_path: source, output_path: output.clone(), ..Default::default() }).run().unwrap_err();
    assert!(matches!(err, ConvertError::Load(LoadError::Hdf5 { source: H5Error::NotHdf5, .. })));
    assert!(!output.exists());
}

#[test]
fn truncated_source_writes_nothing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let bytes = image_classifier().build().unwrap();
    let source = dir.path().join("keras_model.h5");
    std::fs::write(&source, &bytes[..bytes.len() / 2]).unwrap();
    let output = dir.path().join("model.onnx");
    let err = ModelConverter::new(ConverterConfig { source_path: source, output_path: output.clone(), ..Default::default() }).run().unwrap_err();
    assert!(matches!(err, ConvertError::Load(LoadError::Hdf5 { .. })));
    assert!(!output.exists());
}

#[test]
fn unbuilt_sequential_has_no_signature() {
    let dir = tempfile::tempdir().unwrap();
    let converter = converter(dir.path(), &unbuilt_model());
    let model = converter.load().unwrap();
    assert!(model.inputs.is_empty());
    let err = converter.derive_signature(&model).unwrap_err();
    assert!(matches!(err, ConvertError::Conversion(ConversionError::NoModelInputs)));
    assert!(matches!(converter.run(), Err(ConvertError::Conversion(ConversionError::NoModelInputs))));
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn weights_only_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = KerasFileBuilder::weights_only().layer_weights("dense", vec![("kernel", keras2onnx_import::fixtures::ramp(&[2, 2]))]);
    let err = converter(dir.path(), &file).run().unwrap_err();
    assert!(matches!(err, ConvertError::Load(LoadError::NotAKerasModel { .. })));
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn unsupported_input_dtype_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let err = converter(dir.path(), &tabular_model("string")).run().unwrap_err();
    match err {
        ConvertError::Conversion(ConversionError::UnsupportedDType { name, dtype }) => {
            assert_eq!(name, "input");
            assert_eq!(dtype, "string");
        }
        other => panic!("unexpected error {}", other),
    }
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn conversion_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let converter = converter(dir.path(), &branching_model());
    let model = converter.load().unwrap();
    let signature = converter.derive_signature(&model).unwrap();
    let first = converter.convert(&model, &signature).unwrap();
    let second = converter.convert(&model, &signature).unwrap();
    assert_eq!(first.bytes, second.bytes);

    let reloaded = converter.load().unwrap();
    let third = converter.convert(&reloaded, &signature).unwrap();
    assert_eq!(first.bytes, third.bytes);
}

#[test]
fn rerunning_overwrites_with_identical_content() {
    let dir = tempfile::tempdir().unwrap();
    let converter = converter(dir.path(), &image_classifier());
    let output = converter.run().unwrap().output_path;
    let first = std::fs::read(&output).unwrap();
    converter.run().unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), first);
    // only the source and the model; no temporary files left behind
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}

#[test]
fn branches_share_one_input_transpose() {
    let dir = tempfile::tempdir().unwrap();
    let report = converter(dir.path(), &branching_model()).run().unwrap();
    let model = decode(&report.output_path);
    let graph = graph(&model);
    let outputs: Vec<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(outputs, vec!["flat", "sum"]);
    assert_eq!(dims(&graph.output[0]), vec!["batch_size", "256"]);
    assert_eq!(dims(&graph.output[1]), vec!["batch_size", "8", "8", "2"]);
    let from_input = graph.node.iter().filter(|n| n.input.iter().any(|i| i == "input")).count();
    assert_eq!(from_input, 1);
    assert_eq!(op_types(&model).iter().filter(|op| **op == "Transpose").count(), 3);
}

#[test]
fn nested_model_weights_are_found() {
    let dir = tempfile::tempdir().unwrap();
    let report = converter(dir.path(), &nested_model()).run().unwrap();
    let model = decode(&report.output_path);
    assert_eq!(op_types(&model), vec!["Gemm", "Tanh", "Gemm"]);
    let graph = graph(&model);
    assert_eq!(graph.initializer.len(), 4);
    assert_eq!(graph.output[0].name, "head");
}

#[test]
fn external_data_is_written_beside_the_model() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("keras_model.h5");
    tabular_model("float32").write(&source).unwrap();
    let config = ConverterConfig {
        source_path: source,
        output_path: dir.path().join("model.onnx"),
        weight_storage: WeightStorageStrategy::BinFile { location: "model.weights".to_string() },
        ..Default::default()
    };
    let report = ModelConverter::new(config).run().unwrap();
    let blob = std::fs::read(dir.path().join("model.weights")).unwrap();
    // hidden kernel + bias + score kernel + bias, float32
    assert_eq!(blob.len(), (6 * 8 + 8 + 8 + 1) * 4);

    let model = decode(&report.output_path);
    for initializer in &graph(&model).initializer {
        assert_eq!(initializer.data_location, onnx::tensor_proto::DataLocation::External as i32);
        assert!(initializer.raw_data.is_empty());
        assert!(initializer.external_data.iter().any(|e| e.key == "location" && e.value == "model.weights"));
    }
}

#[test]
fn opset_and_value_info_follow_the_config() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("keras_model.h5");
    tabular_model("float32").write(&source).unwrap();
    let config = ConverterConfig {
        source_path: source.clone(),
        output_path: dir.path().join("model.onnx"),
        target_opset: 17,
        emit_value_info: true,
        ..Default::default()
    };
    let report = ModelConverter::new(config).run().unwrap();
    let model = decode(&report.output_path);
    assert_eq!(model.opset_import[0].version, 17);
    assert!(!graph(&model).value_info.is_empty());

    let config = ConverterConfig { source_path: source, output_path: dir.path().join("old.onnx"), target_opset: 8, ..Default::default() };
    let err = ModelConverter::new(config).run().unwrap_err();
    assert!(matches!(err, ConvertError::Conversion(ConversionError::UnsupportedOpset(8))));
}

#[test]
fn keras_metadata_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let report = converter(dir.path(), &tabular_model("float32").backend(None)).run().unwrap();
    let model = decode(&report.output_path);
    let props: Vec<(&str, &str)> = model.metadata_props.iter().map(|p| (p.key.as_str(), p.value.as_str())).collect();
    assert_eq!(props, vec![("keras_version", "2.15.0")]);
    assert_eq!(model.producer_name, "keras2onnx");
    assert_eq!(graph(&model).name, "tabular");
}
