use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use keras2onnx::{ConversionObserver, ConvertError, ConverterConfig, ModelConverter};
use keras2onnx_import::KerasModel;
use onnx_graph::weights::WeightStorageStrategy;

/// Converts `keras_model.h5` into `model.onnx`. Flags override the config file.
#[derive(Parser, Debug)]
#[command(name = "keras2onnx", version, about = "Convert a Keras HDF5 model to ONNX")]
struct Cli {
    /// JSON file with converter settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Saved Keras model
    #[arg(long)]
    input: Option<PathBuf>,

    /// Destination ONNX file
    #[arg(long)]
    output: Option<PathBuf>,

    /// ONNX opset to target
    #[arg(long)]
    opset: Option<i64>,

    /// Name of the graph input
    #[arg(long)]
    input_name: Option<String>,

    /// Store initializers in this file, next to the output
    #[arg(long)]
    external_data: Option<String>,

    /// Record intermediate tensor shapes in the graph
    #[arg(long)]
    value_info: bool,

    /// Log filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print the supported Keras layer classes and exit
    #[arg(long)]
    list_layers: bool,
}

struct ConsoleObserver;

impl ConversionObserver for ConsoleObserver {
    fn model_loaded(&mut self, _model: &KerasModel) {
        println!("Keras model loaded successfully.");
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<ConverterConfig> {
    let mut config = match &cli.config {
        Some(path) => ConverterConfig::from_json_file(path).with_context(|| "loading converter settings")?,
        None => ConverterConfig::default(),
    };
    if let Some(input) = &cli.input {
        config.source_path = input.clone();
    }
    if let Some(output) = &cli.output {
        config.output_path = output.clone();
    }
    if let Some(opset) = cli.opset {
        config.target_opset = opset;
    }
    if let Some(name) = &cli.input_name {
        config.input_name = name.clone();
    }
    if let Some(location) = &cli.external_data {
        config.weight_storage = WeightStorageStrategy::BinFile { location: location.clone() };
    }
    if cli.value_info {
        config.emit_value_info = true;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if cli.list_layers {
        for name in keras2onnx_import::supported_layers() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return ExitCode::from(4);
        }
    };

    match ModelConverter::new(config).run_observed(&mut ConsoleObserver) {
        Ok(report) => {
            println!("Model successfully converted to {}", report.output_path.display());
            ExitCode::SUCCESS
        }
        Err(ConvertError::Load(err)) => {
            println!("Error loading Keras model: {}", err);
            ExitCode::from(1)
        }
        Err(err @ ConvertError::Conversion(_)) => {
            println!("Error during ONNX conversion: {}", err);
            ExitCode::from(2)
        }
        Err(err @ ConvertError::Write { .. }) => {
            println!("Error during ONNX conversion: {}", err);
            ExitCode::from(3)
        }
    }
}
