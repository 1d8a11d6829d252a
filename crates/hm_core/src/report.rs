use crate::stats::LatencyStats;
use hm_common::ComputeUnitId;
use std::fmt;
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;

/// Run count of one job over the measurement window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRuns {
    pub job: usize,
    pub cu: ComputeUnitId,
    pub runs: u64,
}

/// Aggregate throughput of a pool over one measurement window.
///
/// `total_runs` is always the sum of the per-job counters, and
/// `total_bytes` is the input bytes of every issued run. A run is counted
/// when it is enqueued, so runs that later failed are included.
#[derive(Debug, Clone)]
pub struct ThroughputReport {
    pub per_job: Vec<JobRuns>,
    pub total_runs: u64,
    pub total_bytes: u64,
    pub window: Duration,
    pub latency: LatencyStats,
}

impl ThroughputReport {
    pub fn megabytes(&self) -> f64 {
        self.total_bytes as f64 / MIB
    }

    pub fn runs_per_sec(&self) -> f64 {
        per_sec(self.total_runs as f64, self.window)
    }

    pub fn mb_per_sec(&self) -> f64 {
        per_sec(self.megabytes(), self.window)
    }

    pub fn gb_per_sec(&self) -> f64 {
        self.mb_per_sec() / 1000.0
    }
}

fn per_sec(amount: f64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs > 0.0 { amount / secs } else { 0.0 }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.per_job {
            writeln!(f, "kernel[{}] ({}): {}", entry.job, entry.cu, entry.runs)?;
        }
        let secs = self.window.as_secs_f64();
        writeln!(
            f,
            "Total kernel executions in {:.1} seconds: {}",
            secs, self.total_runs
        )?;
        writeln!(
            f,
            "Data processed in {:.1} seconds: {:.1} MB",
            secs,
            self.megabytes()
        )?;
        writeln!(f, "Runs/sec: {:.2}", self.runs_per_sec())?;
        write!(f, "Data processed/sec: {:.3} GBps", self.gb_per_sec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(runs: &[u64], window: Duration) -> ThroughputReport {
        let per_job: Vec<JobRuns> = runs
            .iter()
            .enumerate()
            .map(|(job, &runs)| JobRuns {
                job,
                cu: ComputeUnitId(job),
                runs,
            })
            .collect();
        let total_runs = runs.iter().sum();
        ThroughputReport {
            per_job,
            total_runs,
            total_bytes: total_runs * 4 * 1024 * 1024,
            window,
            latency: LatencyStats::new(),
        }
    }

    #[test]
    fn rates_follow_window() {
        let r = report(&[10, 30], Duration::from_secs(20));
        assert_eq!(r.total_runs, 40);
        assert_eq!(r.megabytes(), 160.0);
        assert_eq!(r.mb_per_sec(), 8.0);
        assert_eq!(r.runs_per_sec(), 2.0);
        assert!((r.gb_per_sec() - 0.008).abs() < 1e-12);
    }

    #[test]
    fn zero_window_reports_zero_rate() {
        let r = report(&[], Duration::ZERO);
        assert_eq!(r.runs_per_sec(), 0.0);
        let text = r.to_string();
        assert!(text.contains("Total kernel executions in 0.0 seconds: 0"));
    }
}
