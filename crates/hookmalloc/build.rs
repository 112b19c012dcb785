fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let interpose = std::env::var("CARGO_FEATURE_INTERPOSE").is_ok();

    if !interpose {
        return;
    }

    match target_os.as_str() {
        "linux" => {
            // Export only the interception surface, and bind the library's own
            // internal references to itself so a lazily-bound call from inside
            // the library can never resolve back into the system allocator.
            let script = format!("{}/linker/version_script.lds", manifest_dir);
            println!("cargo:rustc-cdylib-link-arg=-Wl,--version-script={}", script);
            println!("cargo:rustc-cdylib-link-arg=-Wl,-Bsymbolic");
            println!("cargo:rustc-cdylib-link-arg=-Wl,-z,now");
            println!("cargo:rerun-if-changed=linker/version_script.lds");
        }
        "macos" => {
            // dyld applies __DATA,__interpose tuples at image map time; all
            // symbols stay exported by default.
        }
        "windows" => {
            let def = format!("{}/linker/exports.def", manifest_dir);
            println!("cargo:rustc-cdylib-link-arg=/DEF:{}", def);
            println!("cargo:rerun-if-changed=linker/exports.def");
        }
        _ => {}
    }
}
