//! Host-side job pipeline for accelerator compute units.
//!
//! This crate provides the pieces needed to keep a set of accelerator
//! compute units continuously busy: host/device buffers, completion events,
//! the accelerator runtime interface with a simulated implementation, and
//! the self-resubmitting jobs driven by a completion dispatcher and a pool.

pub use hm_common::{ComputeUnitId, Migration};

mod activity;

/// Host/device shared buffers with residency tracking.
///
/// A buffer keeps a host view and a device view of the same elements and
/// records which side holds the current data, so that kernels never read
/// stale inputs and the host never reads a region under transfer.
pub mod buffer;

/// Cooperative cancellation shared by every job of a pool.
pub mod cancel;

/// Accelerator runtime interface.
///
/// Describes the operations a job needs from a device: buffer allocation,
/// migrations, kernel launches with dependency lists, and a drain.
pub mod device;

/// Completion dispatcher.
///
/// Receives completions from runtime threads and runs the owning job's
/// continuation on a fixed pool of dispatcher threads.
pub mod dispatcher;

/// Completion events with callback registration.
pub mod event;

/// Loaded hardware image description.
///
/// Lists the kernels, their compute units and timing parameters that a
/// device exposes after an image has been loaded.
pub mod image;

/// Accelerator job bound to one compute unit.
pub mod job;

/// Opaque accelerator function interface.
pub mod kernel;

/// Job pool and measurement driver.
pub mod pool;

/// Throughput report of a measurement window.
pub mod report;

/// Simulated out-of-order accelerator runtime.
pub mod sim;

/// Latency statistics for run round trips.
pub mod stats;

/// Error types returned by pipeline operations.
///
/// Setup errors are returned to the caller directly. Errors raised inside an
/// asynchronous job cycle are recorded on the job and reported by the pool
/// once the measurement window ends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// No compute unit matches the requested selector.
    #[error("no compute unit matches `{0}`")]
    UnknownComputeUnit(String),

    /// The compute unit already executes an invocation.
    #[error("compute unit {0} is busy")]
    ComputeUnitBusy(ComputeUnitId),

    /// No kernel implementation is registered under this name.
    #[error("no kernel implementation registered for `{0}`")]
    UnknownKernel(String),

    /// Kernel arguments do not describe a valid invocation.
    #[error("invalid kernel arguments: {0}")]
    KernelArgs(String),

    /// A kernel read a buffer whose current contents live on the host.
    #[error("buffer {0} is not resident on the device")]
    NotResident(u64),

    /// The host read a buffer whose current contents live on the device.
    #[error("buffer {0} host view is stale")]
    HostStale(u64),

    /// The host touched a buffer while a transfer targeting it is outstanding.
    #[error("buffer {0} has an outstanding transfer")]
    BufferBusy(u64),

    /// The host touched a buffer after its mapping was released.
    #[error("buffer {0} is unmapped")]
    BufferUnmapped(u64),

    /// Host data does not fit the buffer.
    #[error("buffer {id} holds {capacity} elements, got {len}")]
    BufferSize { id: u64, capacity: usize, len: usize },

    /// A job was asked to run while its previous run is still in flight.
    #[error("job {0} already has a run in flight")]
    AlreadyInFlight(usize),

    /// A command could not be submitted to the device.
    #[error("enqueue failed: {0}")]
    Enqueue(String),

    /// An asynchronous command finished with an error.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Output did not match the reference combination of the inputs.
    #[error("verify failed on job {job}: result[{index}] = {got}, expected {expected}")]
    VerifyFailed {
        job: usize,
        index: usize,
        got: u32,
        expected: u32,
    },

    /// The runtime could not provide a resource.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The loaded image is inconsistent.
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

pub type Result<T, E = PipelineError> = core::result::Result<T, E>;

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
