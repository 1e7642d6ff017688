fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Proto compilation is optional - the generated code is included in the repo
    // To regenerate, install protoc and run: cargo build --features proto-gen

    #[cfg(feature = "proto-gen")]
    {
        std::fs::create_dir_all("src/generated")?;

        tonic_build::configure()
            .build_server(false)
            .build_client(true)
            .out_dir("src/generated")
            .compile_protos(&["../../proto/taskbroker.proto"], &["../../proto"])?;
    }

    Ok(())
}
