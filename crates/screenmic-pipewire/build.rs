//! Build script for screenmic-pipewire.
//!
//! Checks that libpipewire is available.

fn main() {
    if let Err(e) = pkg_config::probe_library("libpipewire-0.3") {
        println!("cargo:warning=libpipewire-0.3 not found: {e}");
        println!("cargo:warning=Install pipewire-devel (Fedora) or libpipewire-0.3-dev (Debian/Ubuntu)");
    }
}
