fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::env::var("OUT_DIR")?;
    tonic_build::configure()
        .file_descriptor_set_path(std::path::PathBuf::from(out_dir).join("meshqueue_descriptor.bin"))
        .compile(&["proto/meshqueue.proto"], &["proto"])?;
    Ok(())
}
