//! Scan (SAF) protocol: activates chunk windows and resumes after interrupts.

use tracing::{debug, trace, warn};

use super::{CoreTestExecutor, CoreTestRun, Supervisor};
use crate::error::IfsError;
use crate::fault::{describe_scan_code, ScanErrorCode};
use crate::layout::{ActivateCommand, RunStatus};
use crate::msr::TestKind;
use crate::state::{LoadState, RunResult};

/// How a run-status word is to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// Every chunk ran; the word carries the verdict.
    Completed,
    /// Stopped early; continue from the given chunk.
    Resume(u16),
    /// The test never started; repeat the same window.
    Retry,
    /// Hardware reported an error that cannot be retried.
    Terminal,
}

/// Classifies a run status for a window stopping at `stop`.
#[must_use]
pub fn classify(status: &RunStatus, stop: u16) -> ScanStep {
    if status.control_error || status.signature_error {
        return ScanStep::Terminal;
    }
    let resume_at = || {
        let last = stop.saturating_sub(1);
        ScanStep::Resume(status.chunk_num.saturating_add(1).min(last))
    };
    match ScanErrorCode::from_u8(status.error_code) {
        Some(ScanErrorCode::NoError) => {
            if u32::from(status.chunk_num) + 1 >= u32::from(status.chunk_stop_index) {
                ScanStep::Completed
            } else {
                resume_at()
            }
        }
        Some(ScanErrorCode::InterruptedDuringExecution) => resume_at(),
        Some(code) if code.not_started() => ScanStep::Retry,
        _ => ScanStep::Terminal,
    }
}

impl CoreTestExecutor<'_> {
    pub(super) fn run_scan(
        &self,
        run: &CoreTestRun,
        state: &LoadState,
    ) -> Result<RunResult, IfsError> {
        let Some(msrs) = TestKind::Saf.msrs() else {
            return Err(IfsError::NoImage {
                kind: TestKind::Saf,
            });
        };
        let layout = state.layout();
        let stop = run.stop_index;
        let mut start = run.start_index;
        let mut supervisor = Supervisor::new(self.config);

        loop {
            let command = layout.encode_activate(ActivateCommand {
                start,
                stop,
                delay: self.config.thread_wait_delay,
                sigmce: self.config.sigmce,
            });
            trace!(cpu = run.cpu, start, stop, "activating scan");

            let word = self.isolated_round(
                &run.siblings,
                |cpu| self.hw.write(cpu, msrs.activate, command),
                |cpu| self.hw.read(cpu, msrs.status),
            )?;

            let next = match word {
                None => start,
                Some(word) => {
                    let status = layout.decode_run_status(word);
                    match classify(&status, stop) {
                        ScanStep::Completed => return Ok(verdict(&status, word)),
                        ScanStep::Terminal => {
                            warn!(
                                cpu = run.cpu,
                                chunk = status.chunk_num,
                                error = %describe_scan_code(status.error_code),
                                control = status.control_error,
                                signature = status.signature_error,
                                "scan failed"
                            );
                            return Ok(RunResult::fail(word));
                        }
                        ScanStep::Resume(next) => {
                            debug!(cpu = run.cpu, chunk = status.chunk_num, next, "scan interrupted");
                            next
                        }
                        ScanStep::Retry => {
                            debug!(
                                cpu = run.cpu,
                                error = %describe_scan_code(status.error_code),
                                "scan did not start"
                            );
                            start
                        }
                    }
                }
            };

            if let Some(code) = supervisor.after_round(next > start) {
                return Ok(RunResult::fail(code.details()));
            }
            start = next;
        }
    }
}

fn verdict(status: &RunStatus, word: u64) -> RunResult {
    if status.is_clean() {
        RunResult::pass(word)
    } else {
        RunResult::fail(word)
    }
}
