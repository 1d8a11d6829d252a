//! Common definitions shared across the host-memory pipeline crates.
//!
//! This crate provides compute-unit identifiers, migration directions and
//! the default benchmark parameters used by the host tool and the simulated
//! device.

#![no_std]

use core::fmt;

/// Index of a compute unit inside a loaded hardware image.
///
/// Compute units are numbered in the order the image declares them. The
/// identifier is only meaningful for the device that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeUnitId(pub usize);

impl ComputeUnitId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ComputeUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cu#{}", self.0)
    }
}

/// Direction of a host/device buffer migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Host view is copied into the device view.
    ToDevice,
    /// Device view is copied back into the host view.
    ToHost,
}

/// Default benchmark parameters.
///
/// The benchmark drives fourteen `vadd` compute units with 512 Ki elements
/// per buffer (2 MiB) over a twenty second measurement window.
pub mod defaults {
    /// Kernel whose compute units the host binds jobs to.
    pub const KERNEL: &str = "vadd";

    /// Number of compute units driven concurrently.
    pub const COMPUTE_UNITS: usize = 14;

    /// Elements per buffer.
    pub const ELEMENTS: usize = 1024 * 512;

    /// Measurement window in seconds.
    pub const WINDOW_SECS: u64 = 20;

    /// Threads draining the completion queue.
    pub const DISPATCHERS: usize = 2;

    /// Device engine threads in addition to one per compute unit.
    pub const EXTRA_ENGINES: usize = 2;

    /// Size of one buffer element in bytes.
    pub const ELEMENT_BYTES: usize = core::mem::size_of::<u32>();
}
