//! Simulated accelerator runtime.
//!
//! [`SimDevice`] behaves like an out-of-order command queue in front of a
//! card: commands are accepted without blocking, held until their wait list
//! completes, and then executed on a fixed pool of engine threads. Transfer
//! time follows the image bandwidth, and each invocation occupies its
//! compute unit for the kernel latency before the kernel function runs on
//! the device views of its buffers.
//!
//! Engine threads belong to the runtime. Event callbacks, including the
//! completion callbacks that jobs register, run on them.

use crate::activity::Activity;
use crate::buffer::{Access, Buffer};
use crate::device::Accelerator;
use crate::event::{Event, EventStatus};
use crate::image::{ComputeUnit, DeviceImage, KernelSelector};
use crate::kernel::{KernelLaunch, KernelRegistry};
use crate::{PipelineError, Result, lock};
use bitvec::prelude::*;
use hm_common::defaults::EXTRA_ENGINES;
use hm_common::{ComputeUnitId, Migration};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Runtime parameters of the simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Engine threads. `None` uses one per compute unit plus a few for
    /// transfers.
    pub engines: Option<usize>,
}

type Work = Box<dyn FnOnce(&Shared, Result<()>) -> Result<()> + Send>;

struct Shared {
    image: DeviceImage,
    busy: Mutex<BitVec>,
    outstanding: Activity,
    executed: AtomicU64,
}

impl Shared {
    fn acquire(&self, cu: ComputeUnitId) -> Result<()> {
        let mut busy = lock(&self.busy);
        if busy[cu.index()] {
            return Err(PipelineError::ComputeUnitBusy(cu));
        }
        busy.set(cu.index(), true);
        Ok(())
    }

    fn release(&self, cu: ComputeUnitId) {
        lock(&self.busy).set(cu.index(), false);
    }
}

/// Command held until its wait list completes.
struct Pending {
    remaining: AtomicUsize,
    failure: Mutex<Option<PipelineError>>,
    work: Mutex<Option<Work>>,
    done: Event,
}

/// Out-of-order command queue backed by an engine thread pool.
pub struct SimDevice {
    shared: Arc<Shared>,
    engines: Arc<rayon::ThreadPool>,
    kernels: KernelRegistry,
}

impl SimDevice {
    /// Creates a device for `image` with kernel implementations from `kernels`.
    pub fn new(image: DeviceImage, kernels: KernelRegistry, config: SimConfig) -> Result<Self> {
        image.validate()?;
        let threads = config
            .engines
            .unwrap_or(image.compute_units.len() + EXTRA_ENGINES)
            .max(1);
        let engines = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hm-engine-{}", i))
            .build()
            .map_err(|e| PipelineError::Runtime(e.to_string()))?;

        debug!(
            image = %image.name,
            compute_units = image.compute_units.len(),
            engines = threads,
            "simulated device ready"
        );

        let busy = bitvec![0; image.compute_units.len()];
        Ok(Self {
            shared: Arc::new(Shared {
                image,
                busy: Mutex::new(busy),
                outstanding: Activity::default(),
                executed: AtomicU64::new(0),
            }),
            engines: Arc::new(engines),
            kernels,
        })
    }

    pub fn image(&self) -> &DeviceImage {
        &self.shared.image
    }

    /// Number of commands that have finished executing, successfully or not.
    pub fn executed_commands(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Number of commands accepted but not yet completed.
    pub fn outstanding_commands(&self) -> usize {
        self.shared.outstanding.current()
    }

    fn submit(&self, wait_list: &[Event], work: Work) -> Event {
        let done = Event::new();
        self.shared.outstanding.enter();

        if wait_list.is_empty() {
            dispatch(&self.engines, &self.shared, work, Ok(()), done.clone());
            return done;
        }

        let pending = Arc::new(Pending {
            remaining: AtomicUsize::new(wait_list.len()),
            failure: Mutex::new(None),
            work: Mutex::new(Some(work)),
            done: done.clone(),
        });

        for event in wait_list {
            let pending = pending.clone();
            let engines = self.engines.clone();
            let shared = self.shared.clone();
            event.on_complete(move |status| {
                if let EventStatus::Failed(err) = status {
                    lock(&pending.failure).get_or_insert_with(|| err.clone());
                }
                if pending.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let deps = match lock(&pending.failure).take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                if let Some(work) = lock(&pending.work).take() {
                    dispatch(&engines, &shared, work, deps, pending.done.clone());
                }
            });
        }
        done
    }
}

fn dispatch(
    engines: &Arc<rayon::ThreadPool>,
    shared: &Arc<Shared>,
    work: Work,
    deps: Result<()>,
    done: Event,
) {
    let shared = shared.clone();
    engines.spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| work(&*shared, deps))).unwrap_or_else(|_| {
            Err(PipelineError::CommandFailed("command panicked".into()))
        });
        shared.executed.fetch_add(1, Ordering::Relaxed);
        done.complete(result);
        shared.outstanding.exit();
    });
}

fn sleep_for(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

impl Accelerator for SimDevice {
    fn compute_units(&self) -> &[ComputeUnit] {
        &self.shared.image.compute_units
    }

    fn resolve(&self, selector: &KernelSelector, taken: &[ComputeUnitId]) -> Result<ComputeUnitId> {
        self.shared
            .image
            .select(selector)
            .map(|cu| cu.id)
            .find(|id| !taken.contains(id))
            .ok_or_else(|| PipelineError::UnknownComputeUnit(selector.to_string()))
    }

    fn allocate(&self, elements: usize, access: Access) -> Result<Buffer> {
        if elements == 0 {
            return Err(PipelineError::Runtime("cannot allocate an empty buffer".into()));
        }
        Ok(Buffer::new(elements, access))
    }

    fn enqueue_migrate(
        &self,
        buffers: &[Buffer],
        direction: Migration,
        wait_list: &[Event],
    ) -> Result<Event> {
        if buffers.is_empty() {
            return Err(PipelineError::Enqueue("migration without buffers".into()));
        }
        for buffer in buffers {
            buffer.begin_transfer();
        }
        let buffers = buffers.to_vec();
        let bytes: usize = buffers.iter().map(Buffer::bytes).sum();
        let delay = self.shared.image.transfer_time(bytes);
        trace!(?direction, bytes, "enqueue migrate");

        Ok(self.submit(
            wait_list,
            Box::new(move |_, deps| {
                if let Err(err) = deps {
                    for buffer in &buffers {
                        buffer.abort_transfer();
                    }
                    return Err(err);
                }
                sleep_for(delay);
                let mut result = Ok(());
                for buffer in &buffers {
                    let outcome = buffer.complete_transfer(direction);
                    if result.is_ok() {
                        result = outcome;
                    }
                }
                result
            }),
        ))
    }

    fn enqueue_task(&self, launch: &KernelLaunch, wait_list: &[Event]) -> Result<Event> {
        let cu = launch.compute_unit();
        let unit = self
            .shared
            .image
            .compute_unit(cu)
            .ok_or_else(|| PipelineError::UnknownComputeUnit(cu.to_string()))?;
        let spec = self
            .shared
            .image
            .kernel(&unit.kernel)
            .ok_or_else(|| PipelineError::UnknownKernel(unit.kernel.clone()))?;
        let kernel = self
            .kernels
            .get(&unit.kernel)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownKernel(unit.kernel.clone()))?;
        let latency = spec.latency;
        let launch = launch.clone();
        trace!(%cu, elements = launch.elements(), "enqueue task");

        Ok(self.submit(
            wait_list,
            Box::new(move |shared, deps| {
                deps?;
                shared.acquire(cu)?;
                sleep_for(latency);
                let result = launch.execute_with(kernel.as_ref());
                shared.release(cu);
                result
            }),
        ))
    }

    fn finish(&self) -> Result<()> {
        self.shared.outstanding.wait_idle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::wait_all;
    use crate::kernel::Kernel;
    use std::time::Instant;

    struct Add;

    impl Kernel for Add {
        fn name(&self) -> &str {
            "vadd"
        }

        fn combine(&self, a: u32, b: u32) -> u32 {
            a.wrapping_add(b)
        }
    }

    struct Broken;

    impl Kernel for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn combine(&self, _: u32, _: u32) -> u32 {
            0
        }

        fn execute(&self, _: &[u32], _: &[u32], _: &mut [u32]) -> Result<()> {
            Err(PipelineError::CommandFailed("kernel fault".into()))
        }
    }

    fn device(latency: Duration) -> SimDevice {
        let image = DeviceImage::new("sim-test")
            .with_kernel("vadd", latency)
            .with_kernel("broken", Duration::ZERO)
            .with_compute_unit("vadd", "vadd_1")
            .with_compute_unit("vadd", "vadd_2")
            .with_compute_unit("broken", "broken_1");
        let mut kernels = KernelRegistry::new();
        kernels.insert("vadd".into(), Arc::new(Add));
        kernels.insert("broken".into(), Arc::new(Broken));
        SimDevice::new(image, kernels, SimConfig::default()).unwrap()
    }

    fn launch(dev: &SimDevice, cu: ComputeUnitId, n: usize) -> KernelLaunch {
        let in1 = dev.allocate(n, Access::ReadOnly).unwrap();
        let in2 = dev.allocate(n, Access::ReadOnly).unwrap();
        let out = dev.allocate(n, Access::WriteOnly).unwrap();
        in1.fill_with(|i| i as u32).unwrap();
        in2.fill_with(|i| i as u32).unwrap();
        KernelLaunch::new(cu, in1, in2, out).unwrap()
    }

    #[test]
    fn dependency_chain_produces_sum() {
        let dev = device(Duration::from_millis(1));
        let l = launch(&dev, ComputeUnitId(0), 8);

        let write = dev
            .enqueue_migrate(&[l.in1().clone(), l.in2().clone()], Migration::ToDevice, &[])
            .unwrap();
        let run = dev.enqueue_task(&l, &[write]).unwrap();
        let read = dev
            .enqueue_migrate(&[l.out().clone()], Migration::ToHost, &[run])
            .unwrap();
        read.wait().unwrap();

        assert_eq!(l.out().read().unwrap(), vec![0, 2, 4, 6, 8, 10, 12, 14]);
        dev.finish().unwrap();
        assert_eq!(dev.outstanding_commands(), 0);
        assert_eq!(dev.executed_commands(), 3);
    }

    #[test]
    fn task_waits_for_its_dependency() {
        let dev = device(Duration::ZERO);
        let l = launch(&dev, ComputeUnitId(1), 4);
        let gate = Event::new();

        let inputs = [l.in1().clone(), l.in2().clone()];
        let write = dev
            .enqueue_migrate(&inputs, Migration::ToDevice, &[gate.clone()])
            .unwrap();
        let run = dev.enqueue_task(&l, &[write.clone()]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(write.status(), EventStatus::Pending);
        assert_eq!(run.status(), EventStatus::Pending);
        assert_eq!(l.in1().read(), Err(PipelineError::BufferBusy(l.in1().id())));

        gate.complete(Ok(()));
        run.wait().unwrap();
        assert_eq!(write.status(), EventStatus::Complete);
    }

    #[test]
    fn failed_dependency_skips_dependents_and_releases_buffers() {
        let dev = device(Duration::ZERO);
        let l = launch(&dev, ComputeUnitId(0), 4);
        let gate = Event::new();

        let inputs = [l.in1().clone(), l.in2().clone()];
        let write = dev
            .enqueue_migrate(&inputs, Migration::ToDevice, &[gate.clone()])
            .unwrap();
        let run = dev.enqueue_task(&l, &[write]).unwrap();
        let read = dev
            .enqueue_migrate(&[l.out().clone()], Migration::ToHost, &[run])
            .unwrap();

        gate.complete(Err(PipelineError::CommandFailed("upstream".into())));
        assert_eq!(
            read.wait(),
            Err(PipelineError::CommandFailed("upstream".into()))
        );
        dev.finish().unwrap();
        assert_eq!(l.in1().pending_transfers(), 0);
        assert_eq!(l.out().pending_transfers(), 0);
    }

    #[test]
    fn kernel_failure_surfaces_on_event() {
        let dev = device(Duration::ZERO);
        let l = launch(&dev, ComputeUnitId(2), 4);
        let write = dev
            .enqueue_migrate(&[l.in1().clone(), l.in2().clone()], Migration::ToDevice, &[])
            .unwrap();
        let run = dev.enqueue_task(&l, &[write]).unwrap();
        assert_eq!(
            run.wait(),
            Err(PipelineError::CommandFailed("kernel fault".into()))
        );
    }

    #[test]
    fn launch_on_stale_inputs_fails() {
        let dev = device(Duration::ZERO);
        let l = launch(&dev, ComputeUnitId(0), 4);
        let run = dev.enqueue_task(&l, &[]).unwrap();
        assert_eq!(run.wait(), Err(PipelineError::NotResident(l.in1().id())));
    }

    #[test]
    fn compute_unit_runs_one_invocation_at_a_time() {
        let dev = device(Duration::from_millis(50));
        let l = launch(&dev, ComputeUnitId(0), 4);
        let write = dev
            .enqueue_migrate(&[l.in1().clone(), l.in2().clone()], Migration::ToDevice, &[])
            .unwrap();
        write.wait().unwrap();

        let first = dev.enqueue_task(&l, &[]).unwrap();
        let second = dev.enqueue_task(&l, &[]).unwrap();
        let outcomes = [first.wait(), second.wait()];
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .any(|o| *o == Err(PipelineError::ComputeUnitBusy(ComputeUnitId(0))))
        );
    }

    #[test]
    fn independent_compute_units_overlap() {
        let dev = device(Duration::from_millis(60));
        let a = launch(&dev, ComputeUnitId(0), 4);
        let b = launch(&dev, ComputeUnitId(1), 4);
        let mut events = Vec::new();
        for l in [&a, &b] {
            let write = dev
                .enqueue_migrate(&[l.in1().clone(), l.in2().clone()], Migration::ToDevice, &[])
                .unwrap();
            write.wait().unwrap();
        }
        let start = Instant::now();
        for l in [&a, &b] {
            events.push(dev.enqueue_task(l, &[]).unwrap());
        }
        wait_all(&events).unwrap();
        assert!(start.elapsed() < Duration::from_millis(115));
    }

    #[test]
    fn resolve_skips_taken_units() {
        let dev = device(Duration::ZERO);
        let sel = KernelSelector::kernel("vadd");
        assert_eq!(dev.resolve(&sel, &[]).unwrap(), ComputeUnitId(0));
        assert_eq!(dev.resolve(&sel, &[ComputeUnitId(0)]).unwrap(), ComputeUnitId(1));
        assert!(matches!(
            dev.resolve(&sel, &[ComputeUnitId(0), ComputeUnitId(1)]),
            Err(PipelineError::UnknownComputeUnit(_))
        ));
        assert!(dev.allocate(0, Access::ReadOnly).is_err());
    }
}
