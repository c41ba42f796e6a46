fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/onnx/onnx.proto");

    prost_build::compile_protos(&["src/onnx/onnx.proto"], &["src/onnx/"])?;

    Ok(())
}
