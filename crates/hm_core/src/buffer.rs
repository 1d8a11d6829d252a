//! Host/device shared buffers.
//!
//! Each buffer carries two views of the same `u32` elements. The host view is
//! what the program fills and verifies; the device view is what kernels read
//! and write. Migrations copy one view into the other. Validity flags track
//! which views currently hold the latest data, and a pending-transfer count
//! keeps the host away from regions the runtime is moving.

use crate::{PipelineError, Result, lock};
use hm_common::Migration;
use hm_common::defaults::ELEMENT_BYTES;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// How kernels use a buffer.
///
/// Checked when a [`crate::kernel::KernelLaunch`] is built; migrations
/// accept either mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Kernel input, written by the host.
    ReadOnly,
    /// Kernel output, read back by the host.
    WriteOnly,
}

struct Views {
    host: Vec<u32>,
    device: Vec<u32>,
    host_valid: bool,
    device_valid: bool,
}

struct Inner {
    id: u64,
    access: Access,
    len: usize,
    views: Mutex<Views>,
    pending: AtomicUsize,
    mapped: AtomicBool,
}

/// Handle to a shared buffer.
///
/// Cloning the handle shares the buffer. A job owns the handles of its
/// buffers; the runtime holds extra clones only while a command that
/// targets the buffer is outstanding.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("access", &self.inner.access)
            .field("len", &self.inner.len)
            .field("pending", &self.pending_transfers())
            .finish()
    }
}

impl Buffer {
    /// Allocates a zeroed buffer of `len` elements, mapped on the host.
    ///
    /// Both views start valid since they hold identical zeroes.
    pub fn new(len: usize, access: Access) -> Self {
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                id,
                access,
                len,
                views: Mutex::new(Views {
                    host: vec![0; len],
                    device: vec![0; len],
                    host_valid: true,
                    device_valid: true,
                }),
                pending: AtomicUsize::new(0),
                mapped: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn access(&self) -> Access {
        self.inner.access
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.len * ELEMENT_BYTES
    }

    pub fn pending_transfers(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.mapped.load(Ordering::Acquire)
    }

    /// Returns true when the device view holds the latest data.
    pub fn is_device_resident(&self) -> bool {
        lock(&self.inner.views).device_valid
    }

    /// Returns true when the host view holds the latest data.
    pub fn is_host_resident(&self) -> bool {
        lock(&self.inner.views).host_valid
    }

    fn check_host_access(&self) -> Result<()> {
        if !self.is_mapped() {
            return Err(PipelineError::BufferUnmapped(self.inner.id));
        }
        if self.pending_transfers() != 0 {
            return Err(PipelineError::BufferBusy(self.inner.id));
        }
        Ok(())
    }

    /// Overwrites the host view. The device view becomes stale.
    pub fn write(&self, data: &[u32]) -> Result<()> {
        self.check_host_access()?;
        if data.len() != self.inner.len {
            return Err(PipelineError::BufferSize {
                id: self.inner.id,
                capacity: self.inner.len,
                len: data.len(),
            });
        }
        let mut views = lock(&self.inner.views);
        views.host.copy_from_slice(data);
        views.host_valid = true;
        views.device_valid = false;
        Ok(())
    }

    /// Fills the host view element by element. The device view becomes stale.
    pub fn fill_with(&self, mut f: impl FnMut(usize) -> u32) -> Result<()> {
        self.check_host_access()?;
        let mut views = lock(&self.inner.views);
        for (i, slot) in views.host.iter_mut().enumerate() {
            *slot = f(i);
        }
        views.host_valid = true;
        views.device_valid = false;
        Ok(())
    }

    /// Runs `f` over the host view.
    ///
    /// Fails if the buffer is unmapped, has a transfer outstanding, or the
    /// latest data has not been migrated back from the device.
    pub fn with_host<R>(&self, f: impl FnOnce(&[u32]) -> R) -> Result<R> {
        self.check_host_access()?;
        let views = lock(&self.inner.views);
        if !views.host_valid {
            return Err(PipelineError::HostStale(self.inner.id));
        }
        Ok(f(&views.host))
    }

    pub fn read(&self) -> Result<Vec<u32>> {
        self.with_host(<[u32]>::to_vec)
    }

    /// Runs `f` over the device view. Fails unless the device view is current.
    pub fn with_device<R>(&self, f: impl FnOnce(&[u32]) -> R) -> Result<R> {
        let views = lock(&self.inner.views);
        if !views.device_valid {
            return Err(PipelineError::NotResident(self.inner.id));
        }
        Ok(f(&views.device))
    }

    /// Runs `f` over the writable device view. The host view becomes stale.
    pub fn with_device_mut<R>(&self, f: impl FnOnce(&mut [u32]) -> R) -> R {
        let mut views = lock(&self.inner.views);
        let out = f(&mut views.device);
        views.device_valid = true;
        views.host_valid = false;
        out
    }

    /// Marks a transfer targeting this buffer as outstanding.
    ///
    /// Called by the runtime when a migration is enqueued. Every call must be
    /// paired with [`Buffer::complete_transfer`] or [`Buffer::abort_transfer`].
    pub fn begin_transfer(&self) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Copies one view into the other and retires the outstanding transfer.
    pub fn complete_transfer(&self, direction: Migration) -> Result<()> {
        let result = {
            let mut views = lock(&self.inner.views);
            let Views {
                host,
                device,
                host_valid,
                device_valid,
            } = &mut *views;
            match direction {
                Migration::ToDevice if *host_valid => {
                    device.copy_from_slice(host);
                    *device_valid = true;
                    Ok(())
                }
                Migration::ToHost if *device_valid => {
                    host.copy_from_slice(device);
                    *host_valid = true;
                    Ok(())
                }
                Migration::ToDevice => Err(PipelineError::HostStale(self.inner.id)),
                Migration::ToHost => Err(PipelineError::NotResident(self.inner.id)),
            }
        };
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Retires an outstanding transfer without copying.
    pub fn abort_transfer(&self) {
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Releases the host mapping. Later host access fails.
    pub fn unmap(&self) {
        if self.inner.mapped.swap(false, Ordering::AcqRel) {
            tracing::trace!(buffer = self.inner.id, "unmapped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_write_then_migrate_makes_device_current() {
        let buf = Buffer::new(4, Access::ReadOnly);
        buf.write(&[1, 2, 3, 4]).unwrap();
        assert!(!buf.is_device_resident());
        assert!(matches!(
            buf.with_device(|d| d.to_vec()),
            Err(PipelineError::NotResident(_))
        ));

        buf.begin_transfer();
        buf.complete_transfer(Migration::ToDevice).unwrap();
        assert_eq!(buf.with_device(|d| d.to_vec()).unwrap(), vec![1, 2, 3, 4]);
        assert!(buf.is_host_resident());
    }

    #[test]
    fn host_access_rejected_while_transfer_outstanding() {
        let buf = Buffer::new(2, Access::WriteOnly);
        buf.begin_transfer();
        assert_eq!(buf.read(), Err(PipelineError::BufferBusy(buf.id())));
        assert_eq!(buf.write(&[1, 2]), Err(PipelineError::BufferBusy(buf.id())));
        buf.abort_transfer();
        assert_eq!(buf.read().unwrap(), vec![0, 0]);
    }

    #[test]
    fn kernel_output_must_come_back_before_host_reads() {
        let buf = Buffer::new(3, Access::WriteOnly);
        buf.with_device_mut(|d| d.copy_from_slice(&[7, 8, 9]));
        assert_eq!(buf.read(), Err(PipelineError::HostStale(buf.id())));

        buf.begin_transfer();
        buf.complete_transfer(Migration::ToHost).unwrap();
        assert_eq!(buf.read().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn write_checks_length_and_mapping() {
        let buf = Buffer::new(2, Access::ReadOnly);
        assert!(matches!(
            buf.write(&[1, 2, 3]),
            Err(PipelineError::BufferSize { capacity: 2, len: 3, .. })
        ));
        buf.unmap();
        assert_eq!(buf.read(), Err(PipelineError::BufferUnmapped(buf.id())));
    }

    #[test]
    fn ids_are_unique() {
        let a = Buffer::new(1, Access::ReadOnly);
        let b = Buffer::new(1, Access::ReadOnly);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.bytes(), 4);
    }
}
