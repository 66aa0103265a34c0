fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the gateway proto for the LLM client
    tonic_build::compile_protos("../../proto/llm.proto")?;
    Ok(())
}
