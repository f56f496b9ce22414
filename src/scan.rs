//! Driving a whole run: write everything, read everything back, then
//! look for the true capacity if the device turned out to wrap around.

use crate::{
    device::{BlockDevice, DeviceError},
    metadata::{Mode, TestOptions},
    pattern::PatternGenerator,
    probe::{CapacityProber, VerifyPrimitive},
    progress::ProgressSink,
    read_test::classify_probe,
    report::{
        Aggregator, BlockOutcome, CapacityVerdict, Completion, IoFailure, Phase, Report,
        RunContext,
    },
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Lets an operator stop a run between two I/O operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanState {
    Idle,
    Writing,
    Verifying,
    Done,
    Failed,
    Cancelled,
}

/// Why a run stopped before finishing.
#[derive(Debug, Error)]
pub enum ScanAbort {
    #[error("cancelled while {phase} at offset {offset}")]
    Cancelled { phase: Phase, offset: u64 },

    #[error("device failed while {phase} at offset {offset}: {error}")]
    Fatal {
        phase: Phase,
        offset: u64,
        #[source]
        error: DeviceError,
    },
}

impl From<ScanAbort> for Completion {
    fn from(abort: ScanAbort) -> Self {
        match abort {
            ScanAbort::Cancelled { phase, offset } => Completion::Cancelled { phase, offset },
            ScanAbort::Fatal {
                phase,
                offset,
                error,
            } => Completion::Aborted {
                phase,
                offset,
                reason: error.to_string(),
            },
        }
    }
}

/// Which kind of I/O failure to record for an operation that failed.
pub(crate) fn io_failure(error: &DeviceError, op: IoFailure) -> IoFailure {
    match error {
        DeviceError::Timeout(_) => IoFailure::Timeout,
        _ => op,
    }
}

/// Owns the device for the duration of a scan and walks its address space.
pub(crate) struct ScanDriver<'a, D, S> {
    pub(crate) device: &'a mut D,
    pub(crate) sink: &'a S,
    pub(crate) opts: &'a TestOptions,
    pub(crate) generator: PatternGenerator,
    pub(crate) extent: u64,
    cancel: CancelToken,
    state: ScanState,
    consecutive_failures: u32,
    probe_round: u64,
    probe_budget: u64,
}

impl<'a, D: BlockDevice, S: ProgressSink> ScanDriver<'a, D, S> {
    pub(crate) fn new(
        device: &'a mut D,
        sink: &'a S,
        opts: &'a TestOptions,
        cancel: CancelToken,
    ) -> Self {
        let extent = opts.extent(device.size_hint());
        Self {
            device,
            sink,
            opts,
            generator: PatternGenerator::new(opts.seed, opts.block_size),
            extent,
            cancel,
            state: ScanState::Idle,
            consecutive_failures: 0,
            probe_round: 0,
            probe_budget: 0,
        }
    }

    pub(crate) fn state(&self) -> ScanState {
        self.state
    }

    fn transition(&mut self, next: ScanState) {
        debug!(from = ?self.state, to = ?next, "Scan state change");
        self.state = next;
    }

    /// Runs the write pass (unless verifying only) and the verify pass.
    pub(crate) fn run(&mut self, aggregator: &mut Aggregator) -> Result<(), ScanAbort> {
        let result = self.scan(aggregator);
        self.transition(match &result {
            Ok(()) => ScanState::Done,
            Err(ScanAbort::Cancelled { .. }) => ScanState::Cancelled,
            Err(ScanAbort::Fatal { .. }) => ScanState::Failed,
        });
        result
    }

    fn scan(&mut self, aggregator: &mut Aggregator) -> Result<(), ScanAbort> {
        if self.opts.mode == Mode::WriteVerify {
            self.transition(ScanState::Writing);
            self.write_phase(aggregator)?;
        }
        // Verification only starts once every write has completed: aliasing
        // is only visible after the whole extent was written.
        self.transition(ScanState::Verifying);
        self.verify_phase(aggregator)
    }

    pub(crate) fn check_cancelled(&self, phase: Phase, offset: u64) -> Result<(), ScanAbort> {
        if self.cancel.is_cancelled() {
            return Err(ScanAbort::Cancelled { phase, offset });
        }
        Ok(())
    }

    pub(crate) fn note_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Books a failed operation. Hands the error back if the scan can go
    /// on, or escalates it when the handle looks unusable.
    pub(crate) fn note_failure(
        &mut self,
        phase: Phase,
        offset: u64,
        error: DeviceError,
    ) -> Result<DeviceError, ScanAbort> {
        self.consecutive_failures += 1;
        if error.is_fatal() {
            return Err(ScanAbort::Fatal {
                phase,
                offset,
                error,
            });
        }
        if self.consecutive_failures > self.opts.max_consecutive_errors {
            return Err(ScanAbort::Fatal {
                phase,
                offset,
                error: DeviceError::Gone(format!(
                    "{} consecutive operations failed, the last with: {error}",
                    self.consecutive_failures
                )),
            });
        }
        Ok(error)
    }
}

impl<D: BlockDevice, S: ProgressSink> VerifyPrimitive for ScanDriver<'_, D, S> {
    fn block_size(&self) -> u64 {
        self.generator.block_size() as u64
    }

    /// Writes fresh patterns to `offsets` in order, then reads each back.
    fn probe(&mut self, offsets: &[u64]) -> Result<Vec<BlockOutcome>, ScanAbort> {
        self.probe_round += 1;
        let seed = self.opts.seed.derive(self.probe_round);
        let generator = PatternGenerator::new(seed, self.generator.block_size());

        for &offset in offsets {
            self.check_cancelled(Phase::Probing, offset)?;
            let payload = generator.expected(offset, generator.block_len(offset, self.extent));
            match self.device.write_at(offset, &payload) {
                Ok(()) => self.note_success(),
                Err(error) => {
                    let error = self.note_failure(Phase::Probing, offset, error)?;
                    warn!(offset, %error, "Probe write failed");
                }
            }
        }
        if let Err(error) = self.device.sync().and_then(|()| self.device.drop_caches()) {
            let offset = offsets.first().copied().unwrap_or_default();
            let error = self.note_failure(Phase::Probing, offset, error)?;
            warn!(%error, "Could not flush probe writes");
        }

        let mut buf = vec![0; generator.block_size()];
        let mut outcomes = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            self.check_cancelled(Phase::Probing, offset)?;
            let block = &mut buf[..generator.block_len(offset, self.extent)];
            let outcome = match self.device.read_at(offset, block) {
                Ok(()) => {
                    self.note_success();
                    classify_probe(&generator, offset, offsets, block)
                }
                Err(error) => {
                    let error = self.note_failure(Phase::Probing, offset, error)?;
                    warn!(offset, %error, "Probe read failed");
                    BlockOutcome::IoError {
                        failure: io_failure(&error, IoFailure::Read),
                    }
                }
            };
            outcomes.push(outcome);
        }
        self.sink.progress(self.probe_round.min(self.probe_budget), self.probe_budget);
        Ok(outcomes)
    }
}

/// Runs a complete test against `device` and returns its report, partial
/// if the run was cancelled or the device failed.
pub(crate) fn execute<D: BlockDevice, S: ProgressSink>(
    device: &mut D,
    opts: &TestOptions,
    sink: &S,
    cancel: &CancelToken,
) -> Report {
    let nominal_size = device.size_hint();
    let mut aggregator = Aggregator::new(opts.max_findings);
    let mut driver = ScanDriver::new(device, sink, opts, cancel.clone());
    let context = RunContext {
        seed: opts.seed,
        mode: opts.mode,
        block_size: opts.block_size as u64,
        nominal_size,
        extent: driver.extent,
    };
    info!(
        seed = %opts.seed,
        nominal_size,
        extent = driver.extent,
        block_size = opts.block_size,
        "Starting scan"
    );

    let mut completion = match driver.run(&mut aggregator) {
        Ok(()) => Completion::Complete,
        Err(abort) => {
            error!(%abort, "Scan stopped early");
            abort.into()
        }
    };

    let mut capacity = None;
    let wants_probe =
        opts.probe && opts.mode == Mode::WriteVerify && completion == Completion::Complete;
    if let Some(lowest) = aggregator.lowest_aliased().filter(|_| wants_probe) {
        match probe_capacity(&mut driver, &aggregator, lowest) {
            Ok(verdict) => capacity = Some(verdict),
            Err(abort) => {
                error!(%abort, "Capacity probe stopped early");
                completion = abort.into();
            }
        }
    }

    debug!(state = ?driver.state(), "Scan driver finished");
    let report = aggregator.finish(context, completion, capacity);
    sink.finished(&report);
    report
}

#[tracing::instrument(name = "capacity probe", skip(driver, aggregator))]
fn probe_capacity<D: BlockDevice, S: ProgressSink>(
    driver: &mut ScanDriver<'_, D, S>,
    aggregator: &Aggregator,
    lowest: u64,
) -> Result<CapacityVerdict, ScanAbort> {
    driver.probe_budget = CapacityProber::max_probes(lowest / driver.block_size());
    driver.sink.phase_started(Phase::Probing, driver.probe_budget);
    let prober = CapacityProber::new(aggregator.alias_distances().to_vec());
    let verdict = prober.locate(driver, lowest)?;
    info!(?verdict, "Capacity probe finished");
    Ok(verdict)
}
