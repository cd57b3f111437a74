use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use ptxverify::config::{GlobalBinding, VerifierConfig, WarpMode};
use ptxverify::error::{Result, VerifyError};
use ptxverify::kernel::Dim3;
use ptxverify::metrics::METRICS_PATH;
use ptxverify::report::{ExitStatus, TextOptions};
use ptxverify::verifier::Verifier;

#[derive(Parser, Debug)]
#[command(name = "ptxverify")]
#[command(version, about = "Static race and barrier verifier for PTX kernels")]
#[command(long_about = "
Emulates every thread of one thread block of a PTX kernel, then checks
barrier usage (deadlocks, arrival mismatches, out-of-order generations)
and reports shared-memory data races between threads not ordered by
barriers.
")]
struct Cli {
    /// PTX file containing exactly one .entry kernel
    file: Option<PathBuf>,

    /// Thread block shape: N, XxY or XxYxZ (defaults to .maxntid/.reqntid)
    #[arg(short = 'n', long, env = "PTXVERIFY_THREADS", value_name = "SHAPE")]
    threads: Option<Dim3>,

    /// Worker threads in the task pool
    #[arg(long, env = "PTXVERIFY_POOL", value_name = "N")]
    pool: Option<usize>,

    /// Warn about unresolved registers, predicates and names
    #[arg(long)]
    warnings: bool,

    /// Print instruction statistics and info-level logs
    #[arg(short, long)]
    verbose: bool,

    /// Print per-stage timings
    #[arg(long)]
    instrument: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// How threads are emulated
    #[arg(long, value_enum, default_value_t = WarpModeArg::Auto)]
    warp_mode: WarpModeArg,

    /// Print at most this many races
    #[arg(long, value_name = "N")]
    max_races: Option<usize>,

    /// Write live snapshots for ptxverify-viz
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = METRICS_PATH)]
    live: Option<PathBuf>,

    /// Bind read-only data to a kernel parameter, e.g. --global in=1,2,3
    #[arg(long = "global", value_name = "NAME=V,V,..", value_parser = parse_global)]
    globals: Vec<GlobalBinding>,

    /// Index of the verified block in the grid (%ctaid)
    #[arg(long, value_name = "SHAPE")]
    block_idx: Option<Dim3>,

    /// Grid shape (%nctaid)
    #[arg(long, value_name = "SHAPE")]
    grid: Option<Dim3>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WarpModeArg {
    Auto,
    LockStep,
    Scalar,
}

impl From<WarpModeArg> for WarpMode {
    fn from(arg: WarpModeArg) -> Self {
        match arg {
            WarpModeArg::Auto => WarpMode::Auto,
            WarpModeArg::LockStep => WarpMode::LockStep,
            WarpModeArg::Scalar => WarpMode::Scalar,
        }
    }
}

fn parse_global(s: &str) -> std::result::Result<GlobalBinding, String> {
    let (name, values) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=V,V,.. but got '{s}'"))?;
    let data = values
        .split(',')
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            let v = v.trim();
            match v.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16),
                None => v.parse::<i64>(),
            }
            .map_err(|e| format!("bad value '{v}' for global '{name}': {e}"))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(GlobalBinding::new(name.trim(), data))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitStatus::Usage.into()
            } else {
                ExitStatus::Success.into()
            };
        }
    };

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(status) => status.into(),
        Err(e) => {
            eprintln!("[ptxverify] error: {e}");
            e.exit_status().into()
        }
    }
}

fn run(cli: Cli) -> Result<ExitStatus> {
    let file = cli.file.ok_or(VerifyError::NoFile)?;

    let mut config = VerifierConfig::new()
        .with_warnings(cli.warnings)
        .with_verbose(cli.verbose)
        .with_instrument(cli.instrument)
        .with_warp_mode(cli.warp_mode.into())
        .with_grid(
            cli.block_idx.unwrap_or(Dim3::new(0, 0, 0)),
            cli.grid.unwrap_or_default(),
        );
    if let Some(threads) = cli.threads {
        config = config.with_block_dim(threads);
    }
    if let Some(pool) = cli.pool {
        config = config.with_pool_size(pool);
    }
    if let Some(path) = cli.live {
        config = config.with_live_metrics(path);
    }
    for binding in cli.globals {
        config = config.with_global(binding);
    }

    let report = Verifier::new(config).verify_file(&file)?;

    if cli.json {
        let json = report
            .to_json()
            .map_err(|e| VerifyError::Internal(format!("failed to serialize report: {e}")))?;
        println!("{json}");
    } else {
        print!(
            "{}",
            report.render_text(&TextOptions {
                max_races: cli.max_races,
                statistics: cli.verbose,
                timings: cli.instrument,
            })
        );
    }
    Ok(report.exit_status())
}
