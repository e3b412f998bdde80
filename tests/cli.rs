mod common;

use std::path::Path;
use std::process::{Command, Output};
use common::*;

fn keras2onnx(dir: &Path, args: &[&str]) -> Output {
    init_logging();
    Command::new(env!("CARGO_BIN_EXE_keras2onnx"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn converts_the_fixed_paths_without_arguments() {
    let dir = tempfile::tempdir().unwrap();
    image_classifier().write(dir.path().join("keras_model.h5")).unwrap();
    let output = keras2onnx(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(0));
    let lines: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(lines, vec!["Keras model loaded successfully.", "Model successfully converted to model.onnx"]);
    let model = decode(&dir.path().join("model.onnx"));
    assert_eq!(graph(&model).input[0].name, "input");
}

#[test]
fn missing_model_exits_with_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = keras2onnx(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout(&output).trim_end(), "Error loading Keras model: No file or directory found at keras_model.h5");
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn unconvertible_model_exits_with_conversion_error() {
    let dir = tempfile::tempdir().unwrap();
    tabular_model("string").write(dir.path().join("keras_model.h5")).unwrap();
    let output = keras2onnx(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(2));
    let text = stdout(&output);
    assert!(text.starts_with("Keras model loaded successfully."));
    assert!(text.contains("Error during ONNX conversion: "));
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn non_hdf5_model_exits_with_load_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("keras_model.h5"), NOT_HDF5).unwrap();
    let output = keras2onnx(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).starts_with("Error loading Keras model: "));
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn unbuilt_model_exits_with_conversion_error() {
    let dir = tempfile::tempdir().unwrap();
    unbuilt_model().write(dir.path().join("keras_model.h5")).unwrap();
    let output = keras2onnx(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(2));
    let text = stdout(&output);
    assert!(text.starts_with("Keras model loaded successfully."));
    assert!(text.contains("Error during ONNX conversion: "));
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn flags_override_the_defaults() {
    let dir = tempfile::tempdir().unwrap();
    tabular_model("float32").write(dir.path().join("scores.h5")).unwrap();
    let output = keras2onnx(dir.path(), &["--input", "scores.h5", "--output", "scores.onnx", "--opset", "15", "--input-name", "features"]);
    assert_eq!(output.status.code(), Some(0));
    let model = decode(&dir.path().join("scores.onnx"));
    assert_eq!(model.opset_import[0].version, 15);
    assert_eq!(graph(&model).input[0].name, "features");
}

#[test]
fn lists_supported_layers() {
    let dir = tempfile::tempdir().unwrap();
    let output = keras2onnx(dir.path(), &["--list-layers"]);
    assert_eq!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.lines().any(|line| line == "Conv2D"));
    assert!(text.lines().any(|line| line == "Dense"));
}

#[test]
fn unreadable_config_exits_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("settings.json"), "[1, 2").unwrap();
    let output = keras2onnx(dir.path(), &["--config", "settings.json"]);
    assert_eq!(output.status.code(), Some(4));
    assert!(stdout(&output).is_empty());
}
