//! Build script for remora-core
//!
//! Checks the toolchain and host before compilation:
//! - Minimum Rust version (Edition 2021 = Rust 1.56.0+, `usize::div_ceil` needs 1.73)
//! - Host platform has a process backend (Linux ptrace or macOS Mach)
//!
//! ## Requirements
//!
//! - **Rust**: 1.73.0 or newer
//! - **Linux**: ptrace and a mounted `/proc`
//! - **macOS**: 10.9+ (Mavericks); attaching needs root or the debugger entitlement

fn main()
{
    match rustc_version::version() {
        Ok(found) => {
            let min_rust_version = rustc_version::Version::new(1, 73, 0);
            if found < min_rust_version {
                panic!("remora-core requires Rust {min_rust_version} or newer, found {found}");
            }
        }
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" && target_os != "macos" {
        // The layout, decoder and resolver still build; only the process backend is missing.
        println!("cargo:warning=remora-core has no process backend for target_os={target_os}");
    }

    println!("cargo:rerun-if-changed=build.rs");
}
