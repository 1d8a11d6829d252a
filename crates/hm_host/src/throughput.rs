use anyhow::{Context, Result, bail};
use hm_common::defaults::ELEMENT_BYTES;
use hm_core::image::{DeviceImage, KernelSelector};
use hm_core::pool::{JobPool, PipelineConfig};
use hm_core::sim::{SimConfig, SimDevice};
use hm_io::{loader, parser};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const MIB: f64 = 1024.0 * 1024.0;

pub struct BenchmarkOptions {
    pub image: PathBuf,
    pub elements: usize,
    pub compute_units: usize,
    pub kernel: String,
    pub selectors: Vec<String>,
    pub duration: u64,
    pub dispatchers: usize,
    pub engines: Option<usize>,
    pub verify: bool,
}

/// Explicit selectors win; otherwise the first `compute_units` instances of
/// `kernel`, capped by what the image provides.
fn selectors(options: &BenchmarkOptions, image: &DeviceImage) -> Result<Vec<KernelSelector>> {
    if !options.selectors.is_empty() {
        return options
            .selectors
            .iter()
            .map(|s| parser::parse_selector(s))
            .collect();
    }

    let any = KernelSelector::kernel(options.kernel.as_str());
    let available = image.select(&any).count();
    if available == 0 {
        bail!(
            "image `{}` has no compute units for kernel `{}`",
            image.name,
            options.kernel
        );
    }
    let count = options.compute_units.min(available);
    if count < options.compute_units {
        info!(
            requested = options.compute_units,
            available, "capping compute units to the image"
        );
    }
    Ok(vec![any; count])
}

/// Formats a byte count in MB, KB or bytes.
fn format_size(bytes: usize) -> String {
    let bytes_f = bytes as f64;
    if bytes_f >= MIB {
        format!("{:.1} MB", bytes_f / MIB)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes_f / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

pub fn run_benchmark(options: &BenchmarkOptions) -> Result<()> {
    if options.elements == 0 {
        bail!("--elements must be at least 1");
    }
    if options.dispatchers == 0 {
        bail!("--dispatchers must be at least 1");
    }

    println!("Loading image from {}...", options.image.display());
    let start_load = Instant::now();
    let image = loader::load_image(&options.image)?;
    println!(
        "Image `{}` loaded in {:?}. Kernels: {}, Compute units: {}",
        image.name,
        start_load.elapsed(),
        image.kernels.len(),
        image.compute_units.len()
    );

    let selectors = selectors(options, &image)?;
    let kernels = hm_hw::registry();
    let device = Arc::new(
        SimDevice::new(
            image,
            kernels.clone(),
            SimConfig {
                engines: options.engines,
            },
        )
        .context("Failed to program the device")?,
    );

    let window = Duration::from_secs(options.duration);
    let config = PipelineConfig {
        elements: options.elements,
        window,
        dispatchers: options.dispatchers,
    };
    println!("Buffer size: {}", format_size(options.elements * ELEMENT_BYTES));
    let pool = JobPool::new(device.clone(), &selectors, config).context("Failed to set up jobs")?;
    for job in pool.jobs() {
        println!("job[{}] -> {}", job.id(), selectors[job.id()]);
    }

    println!(
        "Running {} jobs for {:?}...",
        pool.jobs().len(),
        pool.config().window
    );
    let report = pool.run()?;
    println!(
        "Device `{}` executed {} commands",
        device.image().name,
        device.executed_commands()
    );
    println!("{}", report);
    crate::stats::print_report(&report.latency);

    pool.check().context("A job stopped during the measurement window")?;
    if options.verify {
        let start_verify = Instant::now();
        pool.verify(&kernels).context("Output verification failed")?;
        println!("Verified {} jobs in {:?}", pool.jobs().len(), start_verify.elapsed());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(compute_units: usize, selectors: &[&str]) -> BenchmarkOptions {
        BenchmarkOptions {
            image: PathBuf::new(),
            elements: 16,
            compute_units,
            kernel: "vadd".into(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            duration: 0,
            dispatchers: 1,
            engines: None,
            verify: true,
        }
    }

    fn image(units: usize) -> DeviceImage {
        let mut image = DeviceImage::new("host-test").with_kernel("vadd", Duration::ZERO);
        for i in 1..=units {
            image = image.with_compute_unit("vadd", format!("vadd_{}", i));
        }
        image
    }

    #[test]
    fn compute_units_are_capped_by_image() {
        let picked = selectors(&options(14, &[]), &image(3)).unwrap();
        assert_eq!(picked, vec![KernelSelector::kernel("vadd"); 3]);

        let picked = selectors(&options(2, &[]), &image(3)).unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn explicit_selectors_override_kernel() {
        let picked = selectors(&options(14, &["vadd:{vadd_2}", "vadd"]), &image(3)).unwrap();
        assert_eq!(
            picked,
            vec![
                KernelSelector::instance("vadd", "vadd_2"),
                KernelSelector::kernel("vadd")
            ]
        );
        assert!(selectors(&options(14, &["vadd:{"]), &image(3)).is_err());
    }

    #[test]
    fn buffer_sizes_stay_readable() {
        assert_eq!(format_size(1024 * 512 * 4), "2.0 MB");
        assert_eq!(format_size(16 * 4), "64 bytes");
        assert_eq!(format_size(1000 * 4), "3.9 KB");
        assert_eq!(format_size(1024), "1.0 KB");
    }

    #[test]
    fn missing_kernel_is_an_error() {
        let mut opts = options(1, &[]);
        opts.kernel = "vmul".into();
        assert!(selectors(&opts, &image(2)).is_err());
    }
}
