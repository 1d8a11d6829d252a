mod stats;
mod throughput;

use clap::Parser;
use hm_common::defaults;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Keeps every selected compute unit of a hardware image busy for a fixed
/// window and reports the achieved throughput.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Hardware image descriptor to program onto the device
    image: PathBuf,
    /// Elements in each job buffer
    #[arg(long, default_value_t = defaults::ELEMENTS)]
    elements: usize,
    /// Number of compute units to drive, capped by the image
    #[arg(long, default_value_t = defaults::COMPUTE_UNITS)]
    compute_units: usize,
    /// Kernel whose compute units are driven
    #[arg(long, default_value = defaults::KERNEL)]
    kernel: String,
    /// Explicit compute unit selector such as `vadd:{vadd_1}`; repeatable
    #[arg(long = "cu", value_name = "SELECTOR")]
    cus: Vec<String>,
    /// Measurement window in seconds
    #[arg(short, long, default_value_t = defaults::WINDOW_SECS)]
    duration: u64,
    /// Threads running job continuations
    #[arg(long, default_value_t = defaults::DISPATCHERS)]
    dispatchers: usize,
    /// Device engine threads (default: compute units + 2)
    #[arg(long)]
    engines: Option<usize>,
    /// Skip output verification after the window
    #[arg(long)]
    no_verify: bool,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// What the process prints to standard output and the code it exits with.
#[derive(Debug, PartialEq, Eq)]
struct Exit {
    code: u8,
    message: String,
}

impl Exit {
    fn success() -> Self {
        Self {
            code: 0,
            message: "TEST SUCCESS".into(),
        }
    }

    fn failed(reason: impl std::fmt::Display) -> Self {
        Self {
            code: 1,
            message: format!("TEST FAILED: {}", reason),
        }
    }
}

/// Parses arguments. Help and version requests exit 0 with their text;
/// usage errors exit 1 with a `TEST FAILED` line.
fn parse_args<I, T>(args: I) -> Result<Cli, Exit>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args).map_err(|err| {
        let text = err.to_string();
        if err.use_stderr() {
            Exit::failed(text.trim_end())
        } else {
            Exit {
                code: 0,
                message: text.trim_end().to_string(),
            }
        }
    })
}

fn outcome(result: anyhow::Result<()>) -> Exit {
    match result {
        Ok(()) => Exit::success(),
        Err(err) => Exit::failed(format!("{:#}", err)),
    }
}

fn run(cli: Cli) -> Exit {
    init_tracing(&cli.log_level);

    let options = throughput::BenchmarkOptions {
        image: cli.image,
        elements: cli.elements,
        compute_units: cli.compute_units,
        kernel: cli.kernel,
        selectors: cli.cus,
        duration: cli.duration,
        dispatchers: cli.dispatchers,
        engines: cli.engines,
        verify: !cli.no_verify,
    };
    outcome(throughput::run_benchmark(&options))
}

fn main() -> ExitCode {
    let exit = match parse_args(std::env::args_os()) {
        Ok(cli) => run(cli),
        Err(exit) => exit,
    };
    println!("{}", exit.message);
    ExitCode::from(exit.code)
}
