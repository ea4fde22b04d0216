use std::path::PathBuf;
use std::{env, fs};

fn main() -> Result<(), anyhow::Error> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    let mut proto_config = prost_build::Config::new();
    proto_config.bytes(["."]);

    let file_descriptors = protox::compile(["src/proto/workload.proto"], ["src/proto"])?;

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(false)
        .out_dir(&out_dir)
        .compile_fds_with_config(file_descriptors, proto_config)?;

    // The workload proto declares no package, so prost names its output `_.rs`.
    fs::rename(out_dir.join("_.rs"), out_dir.join("workload.rs"))?;

    println!("cargo:rerun-if-changed=src/proto/workload.proto");
    Ok(())
}
