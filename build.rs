fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored protoc so the build does not depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/quorumkv.proto");
    tonic_build::compile_protos("proto/quorumkv.proto")?;
    Ok(())
}
