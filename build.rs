fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Record git and compiler details for `--version` and the run summary.
    built::write_built_file().expect("Failed to acquire build-time information");
}
