//! Array-BIST protocols for both array generations.

use tracing::{debug, warn};

use super::{CoreTestExecutor, CoreTestRun, Supervisor};
use crate::error::IfsError;
use crate::layout::array::{ArrayCommand, ARRAY_GEN1_STATUS_FAIL, ARRAY_GEN1_TEST_ALL_ARRAYS};
use crate::msr::{MSR_ARRAY_BIST, MSR_ARRAY_STATUS, MSR_ARRAY_TRIGGER};
use crate::state::RunResult;

impl CoreTestExecutor<'_> {
    /// Walks the array bitmask until hardware reports every array tested.
    pub(super) fn run_array_gen0(&self, run: &CoreTestRun) -> Result<RunResult, IfsError> {
        let primary = run.core();
        let mut command = ArrayCommand::all_arrays();
        let mut supervisor = Supervisor::new(self.config);

        loop {
            let word = command.encode();
            let reply = self.isolated_round(
                &run.siblings,
                |cpu| {
                    if cpu == primary {
                        self.hw.write(cpu, MSR_ARRAY_BIST, word)
                    } else {
                        Ok(())
                    }
                },
                |cpu| self.hw.read(cpu, MSR_ARRAY_BIST),
            )?;

            let progressed = match reply {
                None => false,
                Some(reply) => {
                    let result = ArrayCommand::decode(reply);
                    if result.ctrl_result {
                        warn!(
                            cpu = run.cpu,
                            array_bitmask = format_args!("{:#x}", result.array_bitmask),
                            bank = result.array_bank,
                            "array test failed"
                        );
                        return Ok(RunResult::fail(reply));
                    }
                    if result.is_done() {
                        return Ok(RunResult::pass(reply));
                    }
                    let next = ArrayCommand {
                        ctrl_result: false,
                        ..result
                    };
                    let progressed = next != command;
                    debug!(
                        cpu = run.cpu,
                        remaining = format_args!("{:#x}", next.array_bitmask),
                        progressed,
                        "array test interrupted"
                    );
                    command = next;
                    progressed
                }
            };

            if let Some(code) = supervisor.after_round(progressed) {
                return Ok(RunResult::fail(code.details()));
            }
        }
    }

    /// Single trigger/status round.
    pub(super) fn run_array_gen1(&self, run: &CoreTestRun) -> Result<RunResult, IfsError> {
        let primary = run.core();
        let mut supervisor = Supervisor::new(self.config);

        loop {
            let reply = self.isolated_round(
                &run.siblings,
                |cpu| {
                    if cpu == primary {
                        self.hw.write(cpu, MSR_ARRAY_TRIGGER, ARRAY_GEN1_TEST_ALL_ARRAYS)
                    } else {
                        Ok(())
                    }
                },
                |cpu| self.hw.read(cpu, MSR_ARRAY_STATUS),
            )?;

            if let Some(status) = reply {
                if status & ARRAY_GEN1_STATUS_FAIL != 0 {
                    warn!(cpu = run.cpu, status = format_args!("{status:#x}"), "array test failed");
                    return Ok(RunResult::fail(status));
                }
                return Ok(RunResult::pass(status));
            }
            if let Some(code) = supervisor.after_round(false) {
                return Ok(RunResult::fail(code.details()));
            }
        }
    }
}
