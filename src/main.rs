use anyhow::Context;
use clap::Parser;
use indicatif::ProgressStyle;
use std::{fs::File, path::Path, path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[macro_use]
extern crate lazy_static;

mod crypto;
mod device;
mod metadata;
mod pattern;
mod probe;
mod progress;
mod report;
mod scan;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as os;

#[cfg(not(target_os = "linux"))]
mod other_os;
#[cfg(not(target_os = "linux"))]
use other_os as os;

use crate::{
    crypto::RunSeed,
    device::{BlockDevice, FileDevice, TimedDevice},
    metadata::{Mode, TestOptions},
    progress::BarProgress,
    report::Report,
    scan::CancelToken,
};

/// Exit status when no report could be produced at all.
const OPERATIONAL_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the device to test. Everything on it will be destroyed.
    ///
    /// This should be a whole block device (e.g. /dev/sdb,
    /// /dev/disk/by-id/usb-...), or an image file.
    #[clap(value_parser = clap::value_parser!(os::ValidDevice))]
    device: os::ValidDevice,

    /// Size in bytes of each verified block: a power of two, at least 512.
    ///
    /// Defaults to the physical block size of the device (or 4096 if that is unset).
    #[clap(long)]
    block_size: Option<usize>,

    /// Seed for the written patterns, as printed by an earlier run.
    ///
    /// Picked at random unless given; required with --verify-only.
    #[clap(long)]
    seed: Option<RunSeed>,

    /// Only read back what an earlier run (with the same --seed and
    /// --block-size) wrote; nothing is written.
    #[clap(long)]
    verify_only: bool,

    /// Only test this many bytes from the start of the device.
    #[clap(long)]
    limit: Option<u64>,

    /// Seconds after which a single read or write counts as hung.
    #[clap(long, default_value_t = 30)]
    io_timeout_secs: u64,

    /// How many offending blocks of each kind to list in the report.
    #[clap(long, default_value_t = 64)]
    max_findings: usize,

    /// Give up after this many I/O errors in a row.
    #[clap(long, default_value_t = 32)]
    max_consecutive_errors: u32,

    /// Number of blocks to generate at once while writing.
    #[clap(long, default_value_t = 256)]
    batch_blocks: usize,

    /// Do not search for the true capacity when the device wraps around.
    #[clap(long)]
    no_probe: bool,

    /// Write the final report to this file as JSON.
    #[clap(long)]
    report: Option<PathBuf>,

    /// Run the test even if the given path is a block device but not
    /// a disk (e.g. a single partition).
    #[cfg(target_os = "linux")]
    #[clap(long)]
    allow_any_block_device: bool,

    /// Run the test without any sanity checks.
    #[cfg(not(target_os = "linux"))]
    #[clap(long)]
    i_know_what_im_doing_let_me_skip_sanity_checks: bool,
}

fn main() -> ExitCode {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
    let args = Args::parse();

    match run(&args) {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(error) => {
            error!("Could not run the test: {error:#}");
            ExitCode::from(OPERATIONAL_FAILURE)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<Report> {
    let target = &args.device;
    os::sanity_checks(args, target)?;

    let mode = if args.verify_only {
        Mode::VerifyOnly
    } else {
        Mode::WriteVerify
    };
    let seed = match (args.seed, mode) {
        (Some(seed), _) => seed,
        (None, Mode::WriteVerify) => RunSeed::random(),
        (None, Mode::VerifyOnly) => {
            anyhow::bail!("--verify-only needs the --seed of the run that wrote the device")
        }
    };
    let block_size = args
        .block_size
        .unwrap_or_else(|| target.default_block_size());
    let mut opts = TestOptions::new(block_size, seed, mode)?;
    opts.limit = args.limit;
    opts.batch_blocks = args.batch_blocks;
    opts.max_findings = args.max_findings;
    opts.max_consecutive_errors = args.max_consecutive_errors;
    opts.io_timeout = Duration::from_secs(args.io_timeout_secs);
    opts.probe = !args.no_probe;

    let file = FileDevice::open(&target.path, mode == Mode::WriteVerify)
        .context("Opening the device under test")?;
    if file.size_hint() == 0 {
        anyhow::bail!(
            "{:?} reports a size of zero bytes; there is nothing to test",
            target.path
        );
    }
    let mut dev =
        TimedDevice::spawn(file, opts.io_timeout).context("Starting the device I/O thread")?;

    let cancel = CancelToken::default();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            warn!("Interrupted; stopping after the current block");
            cancel.cancel();
        }
    })
    .context("Installing the interrupt handler")?;

    info!(%seed, device = ?target, block_size, ?mode, "Starting test");
    let report = scan::execute(&mut dev, &opts, &BarProgress::default(), &cancel);
    drop(dev);

    if let Some(report_path) = &args.report {
        if let Err(error) = write_report(report_path, &report) {
            error!("Could not save the report: {error:#}");
        }
    }
    Ok(report)
}

fn write_report(path: &Path, report: &Report) -> anyhow::Result<()> {
    let out = File::create(path).with_context(|| format!("Creating the report file {path:?}"))?;
    serde_json::to_writer_pretty(out, report).context("Writing the report")
}

lazy_static! {
    pub(crate) static ref PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.white/grey} {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta_precise}) {msg}",
    ).expect("Internal error in indicatif progress bar template syntax");
    pub(crate) static ref PROBE_STYLE: ProgressStyle = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.white/grey} {pos}/{len} probes {msg}",
    ).expect("Internal error in indicatif progress bar template syntax");
}
