fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Pass through CIFLOW_GIT_HASH from the container build environment
    println!("cargo:rerun-if-env-changed=CIFLOW_GIT_HASH");
    if let Ok(hash) = std::env::var("CIFLOW_GIT_HASH") {
        println!("cargo:rustc-env=CIFLOW_GIT_HASH={}", hash);
    }
}
