use crate::buffer::{Access, Buffer};
use crate::{PipelineError, Result};
use hm_common::ComputeUnitId;
use std::sync::Arc;

/// Element-wise accelerator function.
///
/// The pipeline treats the kernel as opaque: it reads two input vectors of
/// equal length and writes one output vector. `combine` is the per-element
/// reference used to verify results on the host.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;

    fn combine(&self, a: u32, b: u32) -> u32;

    fn execute(&self, in1: &[u32], in2: &[u32], out: &mut [u32]) -> Result<()> {
        check_lengths(in1, in2, out)?;
        for ((o, &a), &b) in out.iter_mut().zip(in1).zip(in2) {
            *o = self.combine(a, b);
        }
        Ok(())
    }
}

pub fn check_lengths(in1: &[u32], in2: &[u32], out: &[u32]) -> Result<()> {
    if in1.len() != in2.len() || in1.len() != out.len() {
        return Err(PipelineError::KernelArgs(format!(
            "length mismatch: in1={} in2={} out={}",
            in1.len(),
            in2.len(),
            out.len()
        )));
    }
    Ok(())
}

/// Kernel instance bound to a compute unit and its argument buffers.
///
/// Arguments are fixed when the launch is built, the same way a job sets its
/// kernel arguments once and then only re-enqueues the task.
#[derive(Clone, Debug)]
pub struct KernelLaunch {
    cu: ComputeUnitId,
    in1: Buffer,
    in2: Buffer,
    out: Buffer,
}

impl KernelLaunch {
    pub fn new(cu: ComputeUnitId, in1: Buffer, in2: Buffer, out: Buffer) -> Result<Self> {
        if in1.id() == in2.id() || in1.id() == out.id() || in2.id() == out.id() {
            return Err(PipelineError::KernelArgs(
                "input and output buffers must be distinct".into(),
            ));
        }
        if in1.access() != Access::ReadOnly || in2.access() != Access::ReadOnly {
            return Err(PipelineError::KernelArgs("inputs must be read-only buffers".into()));
        }
        if out.access() != Access::WriteOnly {
            return Err(PipelineError::KernelArgs("output must be a write-only buffer".into()));
        }
        if in1.len() != in2.len() || in1.len() != out.len() {
            return Err(PipelineError::KernelArgs(format!(
                "buffer lengths differ: {} / {} / {}",
                in1.len(),
                in2.len(),
                out.len()
            )));
        }
        Ok(Self { cu, in1, in2, out })
    }

    pub fn compute_unit(&self) -> ComputeUnitId {
        self.cu
    }

    pub fn in1(&self) -> &Buffer {
        &self.in1
    }

    pub fn in2(&self) -> &Buffer {
        &self.in2
    }

    pub fn out(&self) -> &Buffer {
        &self.out
    }

    /// Element count passed as the size argument.
    pub fn elements(&self) -> usize {
        self.in1.len()
    }

    /// Runs `kernel` on the device views of the bound buffers.
    pub fn execute_with(&self, kernel: &dyn Kernel) -> Result<()> {
        self.in1.with_device(|a| {
            self.in2.with_device(|b| {
                self.out
                    .with_device_mut(|out| kernel.execute(a, b, out))
            })
        })??
    }
}

/// Registered kernel implementations, looked up by kernel name.
pub type KernelRegistry = std::collections::HashMap<String, Arc<dyn Kernel>>;

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::Migration;

    struct Xor;

    impl Kernel for Xor {
        fn name(&self) -> &str {
            "xor"
        }

        fn combine(&self, a: u32, b: u32) -> u32 {
            a ^ b
        }
    }

    fn resident(data: &[u32], access: Access) -> Buffer {
        let buf = Buffer::new(data.len(), access);
        buf.write(data).unwrap();
        buf.begin_transfer();
        buf.complete_transfer(Migration::ToDevice).unwrap();
        buf
    }

    #[test]
    fn default_execute_maps_combine() {
        let mut out = [0u32; 3];
        Xor.execute(&[1, 2, 3], &[1, 0, 1], &mut out).unwrap();
        assert_eq!(out, [0, 2, 2]);
        assert!(matches!(
            Xor.execute(&[1], &[1, 2], &mut out),
            Err(PipelineError::KernelArgs(_))
        ));
    }

    #[test]
    fn launch_requires_distinct_buffers() {
        let a = Buffer::new(2, Access::ReadOnly);
        let out = Buffer::new(2, Access::WriteOnly);
        let err = KernelLaunch::new(ComputeUnitId(0), a.clone(), a, out).unwrap_err();
        assert!(matches!(err, PipelineError::KernelArgs(_)));
    }

    #[test]
    fn launch_checks_access_modes() {
        let input = || Buffer::new(2, Access::ReadOnly);
        let output = || Buffer::new(2, Access::WriteOnly);

        let err = KernelLaunch::new(ComputeUnitId(0), input(), input(), input()).unwrap_err();
        assert_eq!(
            err,
            PipelineError::KernelArgs("output must be a write-only buffer".into())
        );
        let err = KernelLaunch::new(ComputeUnitId(0), output(), input(), output()).unwrap_err();
        assert_eq!(
            err,
            PipelineError::KernelArgs("inputs must be read-only buffers".into())
        );
        assert!(KernelLaunch::new(ComputeUnitId(0), input(), input(), output()).is_ok());
    }

    #[test]
    fn execute_with_reads_device_views() {
        let launch = KernelLaunch::new(
            ComputeUnitId(1),
            resident(&[5, 6], Access::ReadOnly),
            resident(&[1, 1], Access::ReadOnly),
            Buffer::new(2, Access::WriteOnly),
        )
        .unwrap();
        launch.execute_with(&Xor).unwrap();
        assert_eq!(launch.out().with_device(|d| d.to_vec()).unwrap(), vec![4, 7]);
        assert!(!launch.out().is_host_resident());
    }

    #[test]
    fn execute_with_rejects_stale_inputs() {
        let stale = Buffer::new(2, Access::ReadOnly);
        stale.write(&[1, 2]).unwrap();
        let launch = KernelLaunch::new(
            ComputeUnitId(0),
            stale.clone(),
            resident(&[0, 0], Access::ReadOnly),
            Buffer::new(2, Access::WriteOnly),
        )
        .unwrap();
        assert_eq!(
            launch.execute_with(&Xor),
            Err(PipelineError::NotResident(stale.id()))
        );
    }
}
