//! Where a run reports what it is doing.

use crate::{
    report::{Phase, Report, Verdict},
    PROBE_STYLE, PROGRESS_STYLE,
};
use std::cell::Cell;
use tracing::{error, info, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Receives phase transitions, progress and the final report. Nothing
/// flows back into the run.
pub(crate) trait ProgressSink {
    fn phase_started(&self, phase: Phase, total: u64);

    fn progress(&self, offset: u64, total: u64);

    fn finished(&self, report: &Report);
}

/// Drives a progress bar on the span of the phase currently running.
#[derive(Debug, Default)]
pub(crate) struct BarProgress {
    position: Cell<u64>,
}

impl ProgressSink for BarProgress {
    fn phase_started(&self, phase: Phase, total: u64) {
        info!(%phase, total, "Phase started");
        let style = match phase {
            // Probing counts probe rounds, not bytes.
            Phase::Probing => &*PROBE_STYLE,
            Phase::Writing | Phase::Verifying => &*PROGRESS_STYLE,
        };
        Span::current().pb_set_style(style);
        Span::current().pb_set_length(total);
        self.position.set(0);
    }

    fn progress(&self, offset: u64, _total: u64) {
        let last = self.position.replace(offset);
        Span::current().pb_inc(offset.saturating_sub(last));
    }

    fn finished(&self, report: &Report) {
        let capacity = report.true_capacity();
        match report.verdict {
            Verdict::Honest => info!(
                nominal_size = report.nominal_size,
                blocks = report.blocks_verified,
                "Device is honest"
            ),
            Verdict::CapacityLie => error!(
                nominal_size = report.nominal_size,
                ?capacity,
                aliased = report.aliased.count,
                first_aliased = ?report.aliased.first_offset(),
                displaced = report.displaced.count,
                "DEVICE LIES ABOUT ITS CAPACITY"
            ),
            Verdict::Corrupted => error!(
                corrupted = report.corrupted.count,
                first_corrupted = ?report.corrupted.first_offset(),
                "DATA INCONSISTENCIES DETECTED"
            ),
            Verdict::Unreadable => error!(
                read_errors = report.read_errors.count,
                write_errors = report.write_errors.count,
                "Device has unreadable regions"
            ),
            Verdict::Inconclusive => warn!(
                completion = ?report.completion,
                "Run did not complete; results are partial"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProgressSink;
    use crate::report::{Phase, Report};
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Started(Phase, u64),
        Progress(u64, u64),
        Finished,
    }

    /// Remembers every event it receives.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: RefCell<Vec<Event>>,
    }

    impl RecordingSink {
        pub(crate) fn phases(&self) -> Vec<Phase> {
            self.events
                .borrow()
                .iter()
                .filter_map(|event| match event {
                    Event::Started(phase, _) => Some(*phase),
                    _ => None,
                })
                .collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn phase_started(&self, phase: Phase, total: u64) {
            self.events.borrow_mut().push(Event::Started(phase, total));
        }

        fn progress(&self, offset: u64, total: u64) {
            self.events.borrow_mut().push(Event::Progress(offset, total));
        }

        fn finished(&self, _report: &Report) {
            self.events.borrow_mut().push(Event::Finished);
        }
    }
}
