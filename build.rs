use std::env;
use std::path::PathBuf;

fn main() {
    // Ensure the linker script is passed to the linker
    println!("cargo:rerun-if-changed=linker.ld");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let linker = PathBuf::from(manifest_dir).join("linker.ld");
    println!("cargo:rustc-link-arg=-T{}", linker.display());
}
