//! SBAF protocol: walks every bundle from its first program.

use tracing::{debug, trace, warn};

use super::{CoreTestExecutor, CoreTestRun, Supervisor};
use crate::error::IfsError;
use crate::fault::{describe_scan_code, ScanErrorCode};
use crate::layout::sbaf::{SbafActivate, SbafOutcome, SbafStatus};
use crate::msr::TestKind;
use crate::state::{LoadState, RunResult};

/// Position within the bundle walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    bundle: u16,
    program: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SbafStep {
    BundleDone,
    Resume(Position),
    Terminal,
}

fn classify(status: &SbafStatus, at: Position) -> SbafStep {
    if status.test_fail
        || matches!(
            status.outcome,
            SbafOutcome::SignatureFail | SbafOutcome::TestFail
        )
    {
        return SbafStep::Terminal;
    }
    if status.bundle_completed() {
        return SbafStep::BundleDone;
    }
    match ScanErrorCode::from_u8(status.error_code) {
        Some(code) if code.not_started() => SbafStep::Resume(at),
        Some(code) if code.can_restart() => SbafStep::Resume(Position {
            bundle: status.bundle_idx,
            program: status.pgm_idx,
        }),
        _ => SbafStep::Terminal,
    }
}

impl CoreTestExecutor<'_> {
    /// Runs bundles `0..=max_bundle`, resuming interrupted programs.
    pub(super) fn run_sbaf(
        &self,
        run: &CoreTestRun,
        state: &LoadState,
    ) -> Result<RunResult, IfsError> {
        let Some(msrs) = TestKind::Sbaf.msrs() else {
            return Err(IfsError::NoImage {
                kind: TestKind::Sbaf,
            });
        };
        let mut supervisor = Supervisor::new(self.config);
        let mut last_word = 0;
        let mut bundle = 0u16;

        while bundle <= state.max_bundle {
            let mut at = Position { bundle, program: 0 };
            loop {
                let command = SbafActivate {
                    bundle_idx: at.bundle,
                    pgm_idx: at.program,
                    delay: self.config.thread_wait_delay,
                    sigmce: self.config.sigmce,
                }
                .encode();
                trace!(cpu = run.cpu, bundle = at.bundle, program = at.program, "activating sbaf");

                let reply = self.isolated_round(
                    &run.siblings,
                    |cpu| self.hw.write(cpu, msrs.activate, command),
                    |cpu| self.hw.read(cpu, msrs.status),
                )?;

                let next = match reply {
                    None => at,
                    Some(word) => {
                        last_word = word;
                        let status = SbafStatus::decode(word);
                        match classify(&status, at) {
                            SbafStep::BundleDone => {
                                debug!(cpu = run.cpu, bundle, "sbaf bundle completed");
                                break;
                            }
                            SbafStep::Terminal => {
                                warn!(
                                    cpu = run.cpu,
                                    bundle = status.bundle_idx,
                                    program = status.pgm_idx,
                                    outcome = ?status.outcome,
                                    error = %describe_scan_code(status.error_code),
                                    "sbaf test failed"
                                );
                                return Ok(RunResult::fail(word));
                            }
                            SbafStep::Resume(next) => next,
                        }
                    }
                };

                if let Some(code) = supervisor.after_round(next > at) {
                    return Ok(RunResult::fail(code.details()));
                }
                at = next;
            }
            bundle = match bundle.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(RunResult::pass(last_word))
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, Position, SbafStep};
    use crate::layout::sbaf::{SbafOutcome, SbafStatus};

    const AT: Position = Position {
        bundle: 1,
        program: 0,
    };

    fn status(outcome: SbafOutcome, error_code: u8, program: u8) -> SbafStatus {
        SbafStatus {
            bundle_idx: 1,
            pgm_idx: program,
            error_code,
            test_fail: false,
            outcome,
        }
    }

    #[test]
    fn clean_status_completes_the_bundle() {
        assert_eq!(classify(&status(SbafOutcome::Pass, 0, 3), AT), SbafStep::BundleDone);
    }

    #[test]
    fn failures_are_terminal() {
        assert_eq!(
            classify(&status(SbafOutcome::SignatureFail, 0, 1), AT),
            SbafStep::Terminal
        );
        assert_eq!(classify(&status(SbafOutcome::TestFail, 0, 1), AT), SbafStep::Terminal);
        let mut flagged = status(SbafOutcome::Pass, 0, 1);
        flagged.test_fail = true;
        assert_eq!(classify(&flagged, AT), SbafStep::Terminal);
        assert_eq!(classify(&status(SbafOutcome::Pass, 0x4, 1), AT), SbafStep::Terminal);
    }

    #[test]
    fn interruptions_resume_at_the_reported_program() {
        assert_eq!(
            classify(&status(SbafOutcome::Interrupted, 0x9, 2), AT),
            SbafStep::Resume(Position {
                bundle: 1,
                program: 2
            })
        );
        assert_eq!(
            classify(&status(SbafOutcome::Interrupted, 0, 2), AT),
            SbafStep::Resume(Position {
                bundle: 1,
                program: 2
            })
        );
    }

    #[test]
    fn not_started_repeats_the_same_position() {
        assert_eq!(
            classify(&status(SbafOutcome::Pass, 0x1, 3), AT),
            SbafStep::Resume(AT)
        );
    }
}
