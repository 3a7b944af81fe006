//! Generates `include/liberty.h` from the `extern "C"` surface.

use std::env;
use std::fs::{self, File};
use std::path::PathBuf;

fn main() {
    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
    let config = cbindgen::Config::from_file(crate_dir.join("cbindgen.toml")).unwrap_or_default();

    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            let include = crate_dir.join("include");
            let header = include.join("liberty.h");
            match fs::create_dir_all(&include).and_then(|()| File::create(&header)) {
                Ok(file) => bindings.write(file),
                Err(err) => {
                    println!("cargo:warning=writing {} failed: {err}", header.display());
                }
            }
        }
        Err(err) => {
            println!("cargo:warning=header generation skipped: {err}");
        }
    }
}
