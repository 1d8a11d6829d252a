/// Build script for hm_hw crate.
///
/// Compiles the C model of the element-wise kernels into a static library
/// linked into the crate, and registers the sources so edits trigger a
/// rebuild.
fn main() {
    cc::Build::new()
        .file("src/kernel/vadd.c")
        .include("src/kernel")
        .opt_level(3)
        .warnings(true)
        .compile("hm_kernels");

    println!("cargo:rerun-if-changed=src/kernel/vadd.c");
    println!("cargo:rerun-if-changed=src/kernel/kernels.h");
}
