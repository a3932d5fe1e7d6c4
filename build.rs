use std::env;

fn main() {
    // Version shown by the CLI banner and sent in the default User-Agent
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let suffix = env::var("LINKFERRY_VERSION_SUFFIX").unwrap_or_default();
    println!("cargo:rustc-env=LINKFERRY_VERSION={version}{suffix}");

    println!("cargo:rerun-if-env-changed=LINKFERRY_VERSION_SUFFIX");
    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=Cargo.toml");
}
