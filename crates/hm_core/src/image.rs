//! Description of a loaded hardware image.
//!
//! An image declares the kernels it implements, the compute units that
//! instantiate them, and the timing the simulated runtime applies to
//! transfers and invocations.

use crate::{PipelineError, Result};
use hm_common::ComputeUnitId;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// One kernel implemented by the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub name: String,
    /// Time one invocation occupies its compute unit.
    pub latency: Duration,
}

/// One instance of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeUnit {
    pub id: ComputeUnitId,
    pub kernel: String,
    pub instance: String,
}

/// Selects a compute unit by kernel name and optional instance name.
///
/// Written `vadd:{vadd_3}` for a specific instance or `vadd` for any
/// instance of the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSelector {
    pub kernel: String,
    pub instance: Option<String>,
}

impl KernelSelector {
    pub fn kernel(kernel: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            instance: None,
        }
    }

    pub fn instance(kernel: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            instance: Some(instance.into()),
        }
    }

    pub fn matches(&self, cu: &ComputeUnit) -> bool {
        self.kernel == cu.kernel
            && self
                .instance
                .as_ref()
                .is_none_or(|instance| *instance == cu.instance)
    }
}

impl fmt::Display for KernelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}:{{{}}}", self.kernel, instance),
            None => write!(f, "{}", self.kernel),
        }
    }
}

/// Kernels and compute units exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceImage {
    pub name: String,
    /// Host/device transfer bandwidth in MB/s. `None` means transfers are
    /// instantaneous.
    pub bandwidth_mbps: Option<u64>,
    pub kernels: Vec<KernelSpec>,
    pub compute_units: Vec<ComputeUnit>,
}

impl DeviceImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_bandwidth(mut self, mbps: u64) -> Self {
        self.bandwidth_mbps = Some(mbps);
        self
    }

    pub fn with_kernel(mut self, name: impl Into<String>, latency: Duration) -> Self {
        self.kernels.push(KernelSpec {
            name: name.into(),
            latency,
        });
        self
    }

    /// Appends a compute unit, numbering it after the existing ones.
    pub fn with_compute_unit(
        mut self,
        kernel: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        let id = ComputeUnitId(self.compute_units.len());
        self.compute_units.push(ComputeUnit {
            id,
            kernel: kernel.into(),
            instance: instance.into(),
        });
        self
    }

    pub fn kernel(&self, name: &str) -> Option<&KernelSpec> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn compute_unit(&self, id: ComputeUnitId) -> Option<&ComputeUnit> {
        self.compute_units.get(id.index())
    }

    /// Returns every compute unit the selector matches, in image order.
    pub fn select<'a>(
        &'a self,
        selector: &'a KernelSelector,
    ) -> impl Iterator<Item = &'a ComputeUnit> {
        self.compute_units
            .iter()
            .filter(move |cu| selector.matches(cu))
    }

    /// Time needed to move `bytes` across the host link.
    pub fn transfer_time(&self, bytes: usize) -> Duration {
        match self.bandwidth_mbps {
            Some(mbps) if mbps > 0 => {
                Duration::from_secs_f64(bytes as f64 / (mbps as f64 * 1_000_000.0))
            }
            _ => Duration::ZERO,
        }
    }

    /// Checks that the image is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.compute_units.is_empty() {
            return Err(PipelineError::InvalidImage(format!(
                "image `{}` declares no compute units",
                self.name
            )));
        }

        let mut kernels = HashSet::new();
        for kernel in &self.kernels {
            if !kernels.insert(kernel.name.as_str()) {
                return Err(PipelineError::InvalidImage(format!(
                    "kernel `{}` declared twice",
                    kernel.name
                )));
            }
        }

        let mut instances = HashSet::new();
        for (index, cu) in self.compute_units.iter().enumerate() {
            if cu.id.index() != index {
                return Err(PipelineError::InvalidImage(format!(
                    "compute unit `{}` numbered {} at position {}",
                    cu.instance, cu.id, index
                )));
            }
            if !kernels.contains(cu.kernel.as_str()) {
                return Err(PipelineError::InvalidImage(format!(
                    "compute unit `{}` references undeclared kernel `{}`",
                    cu.instance, cu.kernel
                )));
            }
            if !instances.insert(cu.instance.as_str()) {
                return Err(PipelineError::InvalidImage(format!(
                    "compute unit `{}` declared twice",
                    cu.instance
                )));
            }
        }
        Ok(())
    }
}
