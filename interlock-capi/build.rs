use std::env;
use std::path::PathBuf;

const HEADER: &str = "interlock-c-sdk/include/interlock.h";

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let Some(workspace_root) = crate_dir.parent().map(PathBuf::from) else {
        return;
    };
    let out_header = workspace_root.join(HEADER);

    let config = cbindgen::Config::from_file(crate_dir.join("cbindgen.toml")).unwrap_or_default();
    let header = match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(header) => header,
        Err(err) => {
            println!("cargo:warning=skipping {HEADER}: {err}");
            return;
        }
    };

    if let Some(parent) = out_header.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    header.write_to_file(out_header);
}
