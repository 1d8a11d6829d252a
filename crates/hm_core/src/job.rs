//! Accelerator job bound to one compute unit.
//!
//! A job owns two input buffers and one output buffer and keeps its compute
//! unit busy by resubmitting itself. One run is the chain
//!
//! ```text
//! migrate inputs -> kernel -> migrate output back -> completion
//! ```
//!
//! where each step waits on the previous step's event instead of on the host.
//! The completion is routed through the dispatcher to [`Job::on_complete`],
//! which starts the next run unless the pool has been cancelled.

use crate::activity::Activity;
use crate::buffer::Access;
use crate::cancel::CancellationToken;
use crate::device::Accelerator;
use crate::dispatcher::{Completion, CompletionSender};
use crate::event::{EventStatus, wait_all};
use crate::kernel::{Kernel, KernelLaunch};
use crate::stats::LatencyStats;
use crate::{PipelineError, Result, lock};
use hm_common::{ComputeUnitId, Migration};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Shared handles every job of a pool is built with.
pub(crate) struct JobContext {
    pub(crate) device: Arc<dyn Accelerator>,
    pub(crate) token: CancellationToken,
    pub(crate) completions: CompletionSender,
    pub(crate) activity: Arc<Activity>,
}

pub struct Job {
    id: usize,
    launch: KernelLaunch,
    device: Arc<dyn Accelerator>,
    token: CancellationToken,
    completions: CompletionSender,
    activity: Arc<Activity>,
    runs: AtomicU64,
    in_flight: AtomicBool,
    started: Mutex<Option<Instant>>,
    latency: Mutex<LatencyStats>,
    failure: Mutex<Option<PipelineError>>,
}

impl Job {
    /// Allocates the job's buffers and stages them on the device.
    ///
    /// Both inputs hold `0..elements`; the output starts zeroed. All three
    /// buffers are migrated to the device before this returns.
    pub(crate) fn new(
        id: usize,
        cu: ComputeUnitId,
        elements: usize,
        ctx: &JobContext,
    ) -> Result<Arc<Self>> {
        let in1 = ctx.device.allocate(elements, Access::ReadOnly)?;
        let in2 = ctx.device.allocate(elements, Access::ReadOnly)?;
        let out = ctx.device.allocate(elements, Access::WriteOnly)?;

        in1.fill_with(|i| i as u32)?;
        in2.fill_with(|i| i as u32)?;

        let staged = [
            ctx.device
                .enqueue_migrate(&[in1.clone(), in2.clone()], Migration::ToDevice, &[])?,
            ctx.device
                .enqueue_migrate(std::slice::from_ref(&out), Migration::ToDevice, &[])?,
        ];
        wait_all(&staged)?;

        let launch = KernelLaunch::new(cu, in1, in2, out)?;
        debug!(job = id, %cu, elements, "job ready");

        Ok(Arc::new(Self {
            id,
            launch,
            device: ctx.device.clone(),
            token: ctx.token.clone(),
            completions: ctx.completions.clone(),
            activity: ctx.activity.clone(),
            runs: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            started: Mutex::new(None),
            latency: Mutex::new(LatencyStats::new()),
            failure: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn compute_unit(&self) -> ComputeUnitId {
        self.launch.compute_unit()
    }

    pub fn elements(&self) -> usize {
        self.launch.elements()
    }

    /// Input bytes moved to the device per run.
    pub fn bytes_per_run(&self) -> usize {
        self.launch.in1().bytes() + self.launch.in2().bytes()
    }

    /// Runs issued so far. A run is counted when it is enqueued.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn latency(&self) -> LatencyStats {
        lock(&self.latency).clone()
    }

    /// Error that ended this job's cycle, if any.
    pub fn failure(&self) -> Option<PipelineError> {
        lock(&self.failure).clone()
    }

    /// Starts the job's cycle with a synchronous first run.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        self.activity.enter();
        if let Err(err) = self.run() {
            self.activity.exit();
            return Err(err);
        }
        Ok(())
    }

    /// Enqueues one run and returns without waiting for it.
    ///
    /// Rejected with [`PipelineError::AlreadyInFlight`] while the previous
    /// run has not completed.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyInFlight(self.id));
        }
        let result = self.enqueue();
        if result.is_err() {
            self.in_flight.store(false, Ordering::Release);
        }
        result
    }

    fn enqueue(self: &Arc<Self>) -> Result<()> {
        let run = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.started) = Some(Instant::now());
        trace!(job = self.id, run, "enqueue run");

        let inputs = [self.launch.in1().clone(), self.launch.in2().clone()];
        let write = self
            .device
            .enqueue_migrate(&inputs, Migration::ToDevice, &[])?;
        let kernel_done = self.device.enqueue_task(&self.launch, &[write])?;
        let read_done = self.device.enqueue_migrate(
            std::slice::from_ref(self.launch.out()),
            Migration::ToHost,
            &[kernel_done],
        )?;

        let job = self.clone();
        let completions = self.completions.clone();
        read_done.on_complete(move |status| {
            let completion = Completion {
                job,
                status: status.clone(),
            };
            if let Err(completion) = completions.send(completion) {
                completion.job.in_flight.store(false, Ordering::Release);
                completion.job.retire("dispatcher stopped");
            }
        });
        Ok(())
    }

    /// Continuation of a run, called once per run by the dispatcher.
    ///
    /// Resubmits the job unless the pool was cancelled or the run failed.
    pub fn on_complete(self: &Arc<Self>, status: EventStatus) {
        if let Some(started) = lock(&self.started).take() {
            lock(&self.latency).update(started.elapsed().as_nanos() as u64);
        }
        self.in_flight.store(false, Ordering::Release);

        if let EventStatus::Failed(err) = status {
            self.fail(err);
            return;
        }
        if self.token.is_cancelled() {
            self.retire("cancelled");
            return;
        }
        if let Err(err) = self.run() {
            self.fail(err);
        }
    }

    fn fail(&self, err: PipelineError) {
        warn!(job = self.id, cu = %self.compute_unit(), error = %err, "job stopped");
        lock(&self.failure).get_or_insert(err);
        self.retire("failed");
    }

    fn retire(&self, reason: &str) {
        trace!(job = self.id, runs = self.runs(), reason, "job idle");
        self.activity.exit();
    }

    /// Checks every output element against `kernel.combine` of the inputs.
    ///
    /// Must only be called while the job is idle; a buffer with a transfer
    /// outstanding is reported as busy.
    pub fn verify(&self, kernel: &dyn Kernel) -> Result<()> {
        let mismatch = self.launch.in1().with_host(|a| {
            self.launch.in2().with_host(|b| {
                self.launch.out().with_host(|out| {
                    a.iter()
                        .zip(b)
                        .zip(out)
                        .enumerate()
                        .map(|(index, ((&a, &b), &got))| (index, got, kernel.combine(a, b)))
                        .find(|&(_, got, expected)| got != expected)
                })
            })
        })???;

        match mismatch {
            Some((index, got, expected)) => Err(PipelineError::VerifyFailed {
                job: self.id,
                index,
                got,
                expected,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        self.launch.out().unmap();
        self.launch.in2().unmap();
        self.launch.in1().unmap();
        trace!(job = self.id, "buffers released");
    }
}
