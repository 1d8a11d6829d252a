use crate::Result;
use crate::buffer::{Access, Buffer};
use crate::event::Event;
use crate::image::{ComputeUnit, KernelSelector};
use crate::kernel::KernelLaunch;
use hm_common::{ComputeUnitId, Migration};

/// Command interface of an accelerator runtime.
///
/// Every `enqueue_*` call returns immediately with an [`Event`]. The command
/// starts only after every event in `wait_list` completed successfully; if a
/// dependency failed, the command fails without running. Commands whose
/// dependencies are satisfied may run in any order, so ordering inside a job
/// is expressed entirely through wait lists.
pub trait Accelerator: Send + Sync {
    fn compute_units(&self) -> &[ComputeUnit];

    /// Resolves a selector to a compute unit, skipping units in `taken`.
    fn resolve(&self, selector: &KernelSelector, taken: &[ComputeUnitId]) -> Result<ComputeUnitId>;

    fn allocate(&self, elements: usize, access: Access) -> Result<Buffer>;

    fn enqueue_migrate(
        &self,
        buffers: &[Buffer],
        direction: Migration,
        wait_list: &[Event],
    ) -> Result<Event>;

    fn enqueue_task(&self, launch: &KernelLaunch, wait_list: &[Event]) -> Result<Event>;

    /// Blocks until every command enqueued so far has completed.
    fn finish(&self) -> Result<()>;
}
