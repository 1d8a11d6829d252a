//! Native models of the accelerator kernels.
//!
//! Kernel bodies are written in C, compiled by the build script, and exposed
//! here behind the [`Kernel`] trait so the simulated device can run them on
//! the device views of job buffers.

use hm_core::kernel::{Kernel, KernelRegistry, check_lengths};
use hm_core::{PipelineError, Result};
use std::sync::Arc;

unsafe extern "C" {
    /// Adds `size` elements of `in1` and `in2` into `out`, modulo 2^32.
    ///
    /// # Arguments
    ///
    /// * `in1` - Pointer to the first input vector
    /// * `in2` - Pointer to the second input vector
    /// * `out` - Pointer to the output vector
    /// * `size` - Number of elements in each vector
    fn hm_vadd(in1: *const u32, in2: *const u32, out: *mut u32, size: i32);
}

/// The `vadd` kernel: element-wise wrapping addition.
#[derive(Debug, Default, Clone, Copy)]
pub struct VaddKernel;

impl VaddKernel {
    pub const NAME: &'static str = "vadd";
}

impl Kernel for VaddKernel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn combine(&self, a: u32, b: u32) -> u32 {
        a.wrapping_add(b)
    }

    fn execute(&self, in1: &[u32], in2: &[u32], out: &mut [u32]) -> Result<()> {
        check_lengths(in1, in2, out)?;
        let size = i32::try_from(out.len()).map_err(|_| {
            PipelineError::KernelArgs(format!("{} elements exceed the size argument", out.len()))
        })?;
        // SAFETY: all three slices hold exactly `size` elements and `out`
        // does not alias the inputs because it is a unique borrow.
        unsafe {
            hm_vadd(in1.as_ptr(), in2.as_ptr(), out.as_mut_ptr(), size);
        }
        Ok(())
    }
}

/// Registry with every kernel this crate implements.
pub fn registry() -> KernelRegistry {
    let mut kernels = KernelRegistry::new();
    kernels.insert(VaddKernel::NAME.to_string(), Arc::new(VaddKernel));
    kernels
}
