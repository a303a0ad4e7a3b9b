fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Supply a `protoc` binary when none is available on the host PATH so the
    // proto compilation step is reproducible across build environments.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }
    tonic_build::configure()
        .build_client(true)
        .build_server(false)
        .compile_protos(&["proto/cdcontroller.proto"], &["proto/"])?;
    Ok(())
}
