use std::io::Result;
use std::path::Path;

fn main() -> Result<()> {
    let proto_dir = Path::new("proto");
    let protoc = protoc_bin_vendored::protoc_bin_path()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    println!("cargo:rerun-if-changed=proto/onnx.proto3");
    prost_build::Config::new()
        .protoc_executable(protoc)
        .compile_protos(&[proto_dir.join("onnx.proto3")], &[proto_dir])?;
    Ok(())
}
