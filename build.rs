fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the plugin transport protocol (broker, stdio, controller)
    tonic_prost_build::compile_protos("proto/plugin.proto")?;

    Ok(())
}
