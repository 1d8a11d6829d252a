//! Job pool and measurement driver.
//!
//! The pool binds one job to each selected compute unit, starts every job
//! from the calling thread, lets them resubmit themselves for the
//! measurement window, then cancels and drains before summing run counters.

use crate::activity::Activity;
use crate::cancel::CancellationToken;
use crate::device::Accelerator;
use crate::dispatcher::CompletionDispatcher;
use crate::image::KernelSelector;
use crate::job::{Job, JobContext};
use crate::kernel::KernelRegistry;
use crate::report::{JobRuns, ThroughputReport};
use crate::stats::LatencyStats;
use crate::{PipelineError, Result};
use hm_common::{ComputeUnitId, defaults};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Interval between progress messages while draining.
const DRAIN_NOTICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Elements in each job buffer.
    pub elements: usize,
    /// Measurement window.
    pub window: Duration,
    /// Threads running job continuations.
    pub dispatchers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            elements: defaults::ELEMENTS,
            window: Duration::from_secs(defaults::WINDOW_SECS),
            dispatchers: defaults::DISPATCHERS,
        }
    }
}

pub struct JobPool {
    device: Arc<dyn Accelerator>,
    jobs: Vec<Arc<Job>>,
    token: CancellationToken,
    activity: Arc<Activity>,
    dispatcher: CompletionDispatcher,
    config: PipelineConfig,
}

impl JobPool {
    /// Creates one job per selector, each on a distinct compute unit.
    pub fn new(
        device: Arc<dyn Accelerator>,
        selectors: &[KernelSelector],
        config: PipelineConfig,
    ) -> Result<Self> {
        if selectors.is_empty() {
            return Err(PipelineError::UnknownComputeUnit("<none>".into()));
        }
        let dispatcher = CompletionDispatcher::new(config.dispatchers)?;
        let ctx = JobContext {
            device: device.clone(),
            token: CancellationToken::new(),
            completions: dispatcher.sender(),
            activity: Arc::new(Activity::default()),
        };

        // Named instances first so a bare kernel selector cannot take a unit
        // that a later named selector requires. Job ids keep selector order.
        let mut order: Vec<usize> = (0..selectors.len()).collect();
        order.sort_by_key(|&i| selectors[i].instance.is_none());

        let mut taken = Vec::with_capacity(selectors.len());
        let mut units = vec![ComputeUnitId(0); selectors.len()];
        for i in order {
            let cu = device.resolve(&selectors[i], &taken)?;
            taken.push(cu);
            units[i] = cu;
        }

        let mut jobs = Vec::with_capacity(selectors.len());
        for (id, cu) in units.into_iter().enumerate() {
            jobs.push(Job::new(id, cu, config.elements, &ctx)?);
        }
        info!(
            jobs = jobs.len(),
            elements = config.elements,
            "job pool allocated"
        );

        Ok(Self {
            device,
            jobs,
            token: ctx.token,
            activity: ctx.activity,
            dispatcher,
            config,
        })
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Jobs whose cycle is still running.
    pub fn active_jobs(&self) -> usize {
        self.activity.current()
    }

    /// Completions routed through the dispatcher so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatcher.dispatched()
    }

    /// Issues every job's first run from the calling thread.
    ///
    /// A pool measures a single window: once stopped, its token stays
    /// cancelled and starting again fails. If a job cannot start, the jobs
    /// already running are stopped and drained before the error is returned.
    pub fn start(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(PipelineError::Runtime(
                "job pool already stopped; build a new pool for another window".into(),
            ));
        }
        for job in &self.jobs {
            if let Err(err) = job.start() {
                self.stop()?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Cancels resubmission and blocks until the device is idle.
    pub fn stop(&self) -> Result<()> {
        self.token.cancel();
        let started = Instant::now();
        while !self.activity.wait_idle_timeout(DRAIN_NOTICE) {
            info!(
                active = self.activity.current(),
                waited = ?started.elapsed(),
                "draining in-flight runs"
            );
        }
        self.device.finish()
    }

    /// Runs the pool for `config.window` and reports throughput.
    ///
    /// Single use, like [`JobPool::start`].
    pub fn run(&self) -> Result<ThroughputReport> {
        self.run_for(self.config.window)
    }

    pub fn run_for(&self, window: Duration) -> Result<ThroughputReport> {
        self.start()?;
        info!(jobs = self.jobs.len(), ?window, "measurement window open");
        thread::sleep(window);
        self.stop()?;
        info!(dispatched = self.dispatched(), "measurement window closed");
        Ok(self.report(window))
    }

    /// Sums the current run counters over `window`.
    pub fn report(&self, window: Duration) -> ThroughputReport {
        let mut latency = LatencyStats::new();
        let mut total_bytes = 0u64;
        let per_job: Vec<JobRuns> = self
            .jobs
            .iter()
            .map(|job| {
                let runs = job.runs();
                total_bytes += runs * job.bytes_per_run() as u64;
                latency.merge(&job.latency());
                JobRuns {
                    job: job.id(),
                    cu: job.compute_unit(),
                    runs,
                }
            })
            .collect();
        let total_runs = per_job.iter().map(|j| j.runs).sum();

        ThroughputReport {
            per_job,
            total_runs,
            total_bytes,
            window,
            latency,
        }
    }

    /// Errors that ended individual jobs, in job order.
    pub fn failures(&self) -> Vec<(usize, PipelineError)> {
        self.jobs
            .iter()
            .filter_map(|job| job.failure().map(|err| (job.id(), err)))
            .collect()
    }

    /// Returns the first job failure, if any job stopped on an error.
    pub fn check(&self) -> Result<()> {
        match self.failures().into_iter().next() {
            Some((job, err)) => {
                warn!(job, error = %err, "pool finished with failed jobs");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Verifies every job's output in parallel against the kernel its
    /// compute unit runs.
    pub fn verify(&self, kernels: &KernelRegistry) -> Result<()> {
        let units = self.device.compute_units();
        self.jobs.par_iter().try_for_each(|job| {
            let name = units
                .get(job.compute_unit().index())
                .map(|cu| cu.kernel.as_str())
                .ok_or_else(|| PipelineError::UnknownComputeUnit(job.compute_unit().to_string()))?;
            let kernel = kernels
                .get(name)
                .ok_or_else(|| PipelineError::UnknownKernel(name.to_string()))?;
            job.verify(kernel.as_ref())
        })
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "drain on drop failed");
        }
    }
}
