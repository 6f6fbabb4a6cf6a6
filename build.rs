use std::env::var_os;

pub fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-env-changed=SOAPYSDR_LIB_DIR");

    // the SoapySDR backend is the only native dependency
    if var_os("CARGO_FEATURE_SOAPYSDR").is_none() {
        return;
    }

    if let Some(dir) = var_os("SOAPYSDR_LIB_DIR") {
        println!(
            "cargo:rustc-link-search={}",
            dir.to_str().expect("invalid SOAPYSDR_LIB_DIR")
        );
    }
    println!("cargo:rustc-link-lib=SoapySDR");
}
