// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

fn main() {
    #[cfg(feature = "c_api")]
    {
        // Find out whether we're in debug or release mode.
        let out_dir = std::env::var("OUT_DIR").expect("No OUT_DIR env variable");
        let profile = std::env::var("PROFILE").expect("No PROFILE env variable");
        let target_dir = std::path::Path::new("target").join(profile);

        println!("cargo:rerun-if-changed=cbindgen.toml");
        println!("cargo:rerun-if-changed=src");

        run_cbindgen();
        generate_pkg_config(&out_dir, &target_dir);
    }
}

#[cfg(feature = "c_api")]
fn run_cbindgen() {
    let crate_dir =
        std::env::var("CARGO_MANIFEST_DIR").expect("No CARGO_MANIFEST_DIR env variable");

    let config = cbindgen::Config::from_file("cbindgen.toml").expect("No cbindgen.toml file");
    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_config(config)
        .generate()
        .expect("Unable to generate bindings")
        .write_to_file("target/include/ucsi-ppm-rs.h");
}

#[cfg(feature = "c_api")]
fn generate_pkg_config(out_dir: &str, target_dir: &std::path::Path) {
    use std::io::Write;

    let dest_path = std::path::Path::new(out_dir).join("ucsi_ppm_rs.pc");
    let mut f = std::fs::File::create(&dest_path).expect("Failed to create ucsi_ppm_rs.pc");

    let contents = format!(
        "prefix=/usr\n\
         exec_prefix=${{prefix}}\n\
         libdir=${{exec_prefix}}/lib\n\
         includedir=${{prefix}}/include\n\
         \n\
         Name: ucsi_ppm_rs\n\
         Description: USB Type-C Connector System software Interface (UCSI) Platform Policy Manager\n\
         Version: {}\n\
         Libs: -L${{libdir}} -lucsi_ppm_rs\n\
         Cflags: -I${{includedir}}\n",
        env!("CARGO_PKG_VERSION")
    );
    f.write_all(contents.as_bytes())
        .expect("Failed to write ucsi_ppm_rs.pc");

    // Make sure the target directory exists. It is created by Cargo
    // automatically during the build process, but it may not exist at this
    // point in time.
    if !target_dir.exists() {
        std::fs::create_dir_all(target_dir).expect("Failed to create target directory");
    }

    std::fs::copy(&dest_path, target_dir.join("ucsi_ppm_rs.pc"))
        .expect("Copying ucsi_ppm_rs.pc into the target directory failed");
}
