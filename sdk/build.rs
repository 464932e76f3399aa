fn main() -> anyhow::Result<()> {
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../protos/server.proto"], &["../protos"])?;

    Ok(())
}
