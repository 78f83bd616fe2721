//! Line-oriented driver scripts for the simulated machine.
//!
//! ```text
//! # two-core machine with one scan batch
//! platform sockets=1 cores=2 threads=2 generation=0 batches=1
//! config max-restarts=3
//! fault interrupt at=2
//! saf current_batch=1
//! saf run_test=0
//! saf status
//! ```
//!
//! `platform` and `config` lines must come before the first line that
//! touches the machine; the machine is built lazily at that point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ifs_core::sim::{
    AuthFault, SbafInterrupt, ScanInterrupt, SimFaults, SimImageSpec, SimSpec, Simulator,
};
use ifs_core::{
    ArrayGeneration, CpuId, Generation, IfsConfig, IfsError, LoadState, TestController, TestKind,
    TestStatus,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::attrs::{self, parse_uint, Attribute};

/// A script line that could not be parsed or executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    /// 1-indexed line number.
    pub line: usize,
    /// Description of the problem.
    pub message: String,
}

/// One `key=value` of a `platform` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformSetting {
    /// `sockets=<n>`
    Sockets(u32),
    /// `cores=<n>` per socket.
    Cores(u32),
    /// `threads=<n>` per core.
    Threads(u32),
    /// `generation=0|2`
    Generation(Generation),
    /// `array-generation=0|1`
    ArrayGeneration(ArrayGeneration),
    /// `batches=<n>`: images installed for batches `1..=n`.
    Batches(u32),
    /// `chunks=<n>` per image.
    Chunks(usize),
    /// `chunk-size=<bytes>`
    ChunkSize(u32),
    /// `version=<n>` of every installed image.
    Version(u32),
    /// `max-bundle=<n>` recorded in SBAF images.
    MaxBundle(u16),
    /// `caps=saf,array,sbaf` or `caps=none`.
    Caps(Vec<TestKind>),
}

/// One `key=value` of a `config` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSetting {
    /// `max-restarts=<n>`
    MaxRestarts(u32),
    /// `run-timeout-ms=<n>`
    RunTimeout(Duration),
    /// `rendezvous-timeout-ms=<n>`
    RendezvousTimeout(Duration),
    /// `thread-wait-delay=<n>`
    ThreadWaitDelay(u32),
    /// `sigmce=on|off`
    Sigmce(bool),
    /// `eager-load=on|off`
    EagerLoad(bool),
    /// `auth-attempts=<n>`
    AuthAttempts(u32),
}

impl ConfigSetting {
    fn apply(self, config: &mut IfsConfig) {
        match self {
            Self::MaxRestarts(n) => config.max_restarts = n,
            Self::RunTimeout(t) => config.run_timeout = t,
            Self::RendezvousTimeout(t) => config.rendezvous_timeout = t,
            Self::ThreadWaitDelay(n) => config.thread_wait_delay = n,
            Self::Sigmce(on) => config.sigmce = on,
            Self::EagerLoad(on) => config.eager_load = on,
            Self::AuthAttempts(n) => config.auth_attempts = n,
        }
    }
}

/// Misbehaviour injected with a `fault` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `fault hash code=<n>`
    Hash(u8),
    /// `fault auth chunk=<n> code=<n> [times=<n>]`
    Auth(AuthFault),
    /// `fault interrupt at=<chunk> [times=<n>]`
    Interrupt(ScanInterrupt),
    /// `fault signature chunk=<n>`
    Signature(u16),
    /// `fault not-started [code=<n>]`
    NotStarted(u8),
    /// `fault array-fail`
    ArrayFail,
    /// `fault array-stall`
    ArrayStall,
    /// `fault sbaf-signature bundle=<n> program=<n>`
    SbafSignature {
        /// Failing bundle.
        bundle: u16,
        /// Failing program.
        program: u8,
    },
    /// `fault sbaf-interrupt bundle=<n> program=<n> [times=<n>]`
    SbafInterrupt(SbafInterrupt),
    /// `fault register reg=<n>`
    Register(u32),
    /// `fault stuck-stride`
    StuckStride,
}

impl Fault {
    fn apply(self, faults: &mut SimFaults) {
        match self {
            Self::Hash(code) => faults.hash_error = Some(code),
            Self::Auth(fault) => faults.auth_error = Some(fault),
            Self::Interrupt(interrupt) => faults.scan_interrupt = Some(interrupt),
            Self::Signature(chunk) => faults.signature_chunk = Some(chunk),
            Self::NotStarted(code) => faults.not_started = Some(code),
            Self::ArrayFail => faults.array_fail = true,
            Self::ArrayStall => faults.array_stall = true,
            Self::SbafSignature { bundle, program } => {
                faults.sbaf_signature = Some((bundle, program));
            }
            Self::SbafInterrupt(interrupt) => faults.sbaf_interrupt = Some(interrupt),
            Self::Register(reg) => faults.register_fault = Some(reg),
            Self::StuckStride => faults.stuck_stride = true,
        }
    }
}

/// A parsed script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Machine shape.
    Platform(Vec<PlatformSetting>),
    /// Controller configuration.
    Config(Vec<ConfigSetting>),
    /// Takes a CPU offline.
    Offline(CpuId),
    /// Brings a CPU back online.
    Online(CpuId),
    /// Injects a fault.
    Fault(Fault),
    /// Removes every injected fault.
    ClearFaults,
    /// Prints an attribute.
    Show {
        /// Target test type.
        test: TestKind,
        /// Attribute to render.
        attribute: Attribute,
    },
    /// Writes an attribute.
    Store {
        /// Target test type.
        test: TestKind,
        /// Attribute to write.
        attribute: Attribute,
        /// Text written.
        value: String,
    },
}

/// A directive with its source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    /// 1-indexed line number.
    pub line: usize,
    /// Parsed content.
    pub directive: Directive,
}

/// Parses a whole script. Blank lines and `#` comments are skipped.
///
/// # Errors
///
/// Returns the first line that does not parse.
pub fn parse_script(text: &str) -> Result<Vec<ScriptLine>, ScriptError> {
    let mut lines = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let stripped = strip_comment(raw).trim();
        if stripped.is_empty() {
            continue;
        }
        let directive =
            parse_directive(stripped).map_err(|message| ScriptError { line, message })?;
        lines.push(ScriptLine { line, directive });
    }
    Ok(lines)
}

fn strip_comment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(code, _)| code)
}

fn parse_directive(text: &str) -> Result<Directive, String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let Some((&head, rest)) = words.split_first() else {
        return Err("empty line".to_string());
    };
    match head {
        "platform" => pairs(rest)?
            .into_iter()
            .map(|(key, value)| parse_platform(key, value))
            .collect::<Result<_, _>>()
            .map(Directive::Platform),
        "config" => pairs(rest)?
            .into_iter()
            .map(|(key, value)| parse_config(key, value))
            .collect::<Result<_, _>>()
            .map(Directive::Config),
        "offline" | "online" => {
            let [cpu] = rest else {
                return Err(format!("expected '{head} <cpu>'"));
            };
            let cpu = number(cpu)?;
            Ok(if head == "offline" {
                Directive::Offline(cpu)
            } else {
                Directive::Online(cpu)
            })
        }
        "fault" => parse_fault(rest),
        test => parse_access(test, rest),
    }
}

fn pairs<'a>(words: &[&'a str]) -> Result<Vec<(&'a str, &'a str)>, String> {
    words
        .iter()
        .map(|word| {
            word.split_once('=')
                .ok_or_else(|| format!("expected key=value, found '{word}'"))
        })
        .collect()
}

fn number<T: TryFrom<u32>>(text: &str) -> Result<T, String> {
    parse_uint(text)
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| format!("invalid number '{text}'"))
}

fn flag(text: &str) -> Result<bool, String> {
    match text {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        _ => Err(format!("invalid flag '{text}'")),
    }
}

fn millis(text: &str) -> Result<Duration, String> {
    number(text).map(Duration::from_millis)
}

fn parse_platform(key: &str, value: &str) -> Result<PlatformSetting, String> {
    Ok(match key {
        "sockets" => PlatformSetting::Sockets(number(value)?),
        "cores" => PlatformSetting::Cores(number(value)?),
        "threads" => PlatformSetting::Threads(number(value)?),
        "generation" => PlatformSetting::Generation(match value {
            "0" => Generation::Gen0,
            "2" => Generation::Gen2,
            _ => return Err(format!("unsupported generation '{value}'")),
        }),
        "array-generation" => PlatformSetting::ArrayGeneration(match value {
            "0" => ArrayGeneration::Gen0,
            "1" => ArrayGeneration::Gen1,
            _ => return Err(format!("unsupported array generation '{value}'")),
        }),
        "batches" => PlatformSetting::Batches(number(value)?),
        "chunks" => PlatformSetting::Chunks(number(value)?),
        "chunk-size" => PlatformSetting::ChunkSize(number(value)?),
        "version" => PlatformSetting::Version(number(value)?),
        "max-bundle" => PlatformSetting::MaxBundle(number(value)?),
        "caps" => PlatformSetting::Caps(parse_caps(value)?),
        _ => return Err(format!("unknown platform setting '{key}'")),
    })
}

fn parse_caps(value: &str) -> Result<Vec<TestKind>, String> {
    if value == "none" {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|name| TestKind::from_name(name).ok_or_else(|| format!("unknown test '{name}'")))
        .collect()
}

fn parse_config(key: &str, value: &str) -> Result<ConfigSetting, String> {
    Ok(match key {
        "max-restarts" => ConfigSetting::MaxRestarts(number(value)?),
        "run-timeout-ms" => ConfigSetting::RunTimeout(millis(value)?),
        "rendezvous-timeout-ms" => ConfigSetting::RendezvousTimeout(millis(value)?),
        "thread-wait-delay" => ConfigSetting::ThreadWaitDelay(number(value)?),
        "sigmce" => ConfigSetting::Sigmce(flag(value)?),
        "eager-load" => ConfigSetting::EagerLoad(flag(value)?),
        "auth-attempts" => ConfigSetting::AuthAttempts(number(value)?),
        _ => return Err(format!("unknown config setting '{key}'")),
    })
}

/// `key=value` settings consumed one key at a time.
struct Fields<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    fn new(words: &[&'a str]) -> Result<Self, String> {
        Ok(Self {
            pairs: pairs(words)?,
        })
    }

    fn take<T: TryFrom<u32>>(&mut self, key: &str) -> Result<Option<T>, String> {
        match self.pairs.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                let (_, value) = self.pairs.remove(index);
                number(value).map(Some)
            }
            None => Ok(None),
        }
    }

    fn require<T: TryFrom<u32>>(&mut self, key: &str) -> Result<T, String> {
        self.take(key)?.ok_or_else(|| format!("missing {key}="))
    }

    fn finish(self) -> Result<(), String> {
        match self.pairs.first() {
            Some((key, _)) => Err(format!("unexpected setting '{key}'")),
            None => Ok(()),
        }
    }
}

fn parse_fault(words: &[&str]) -> Result<Directive, String> {
    let Some((&kind, settings)) = words.split_first() else {
        return Err("expected 'fault <kind>'".to_string());
    };
    let mut fields = Fields::new(settings)?;
    let fault = match kind {
        "clear" => {
            fields.finish()?;
            return Ok(Directive::ClearFaults);
        }
        "hash" => Fault::Hash(fields.require("code")?),
        "auth" => Fault::Auth(AuthFault {
            chunk: fields.require("chunk")?,
            code: fields.require("code")?,
            times: fields.take("times")?.unwrap_or(1),
        }),
        "interrupt" => Fault::Interrupt(ScanInterrupt {
            at: fields.require("at")?,
            times: fields.take("times")?.unwrap_or(1),
        }),
        "signature" => Fault::Signature(fields.require("chunk")?),
        "not-started" => Fault::NotStarted(fields.take("code")?.unwrap_or(1)),
        "array-fail" => Fault::ArrayFail,
        "array-stall" => Fault::ArrayStall,
        "sbaf-signature" => Fault::SbafSignature {
            bundle: fields.require("bundle")?,
            program: fields.require("program")?,
        },
        "sbaf-interrupt" => Fault::SbafInterrupt(SbafInterrupt {
            bundle: fields.require("bundle")?,
            program: fields.require("program")?,
            times: fields.take("times")?.unwrap_or(1),
        }),
        "register" => Fault::Register(fields.require("reg")?),
        "stuck-stride" => Fault::StuckStride,
        other => return Err(format!("unknown fault '{other}'")),
    };
    fields.finish()?;
    Ok(Directive::Fault(fault))
}

fn parse_access(test: &str, rest: &[&str]) -> Result<Directive, String> {
    let kind =
        TestKind::from_name(test).ok_or_else(|| format!("unknown directive or test '{test}'"))?;
    let [access] = rest else {
        return Err(format!("expected '{test} <attribute>[=<value>]'"));
    };
    let attribute = |name: &str| {
        Attribute::from_name(name).ok_or_else(|| format!("unknown attribute '{name}'"))
    };
    Ok(match access.split_once('=') {
        Some((name, value)) => Directive::Store {
            test: kind,
            attribute: attribute(name)?,
            value: value.to_string(),
        },
        None => Directive::Show {
            test: kind,
            attribute: attribute(*access)?,
        },
    })
}

/// Something a script line produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// An attribute was shown.
    Show {
        /// Test type name.
        test: String,
        /// Attribute name.
        attribute: String,
        /// Rendered value.
        value: String,
    },
    /// A store was accepted.
    Store {
        /// Test type name.
        test: String,
        /// Attribute name.
        attribute: String,
        /// Text written.
        value: String,
    },
    /// A show or store was rejected.
    Error {
        /// Script line.
        line: usize,
        /// Test type name.
        test: String,
        /// Attribute name.
        attribute: String,
        /// Reason.
        message: String,
    },
}

impl Event {
    /// True for rejected accesses.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Show {
                test,
                attribute,
                value,
            } => write!(f, "{test}/{attribute}: {value}"),
            Self::Store {
                test,
                attribute,
                value,
            } => write!(f, "{test}/{attribute} <- {value}"),
            Self::Error {
                line,
                test,
                attribute,
                message,
            } => write!(f, "error: line {line}: {test}/{attribute}: {message}"),
        }
    }
}

/// Final view of one test device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    /// Test type name.
    pub test: String,
    /// Verdict of the last run.
    pub status: TestStatus,
    /// Raw status word of the last run.
    pub details: u64,
    /// Selected batch.
    pub current_batch: Option<u32>,
    /// Loaded image revision.
    pub image_version: Option<u32>,
    /// Full load state.
    pub load_state: LoadState,
}

impl DeviceReport {
    fn of(controller: &TestController) -> Self {
        Self {
            test: controller.kind().name().to_string(),
            status: controller.last_status(),
            details: controller.last_details(),
            current_batch: controller.current_batch(),
            image_version: controller.loaded_version(),
            load_state: controller.load_state(),
        }
    }
}

/// Everything a script run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Events in script order.
    pub events: Vec<Event>,
    /// Number of rejected accesses.
    pub failures: usize,
    /// Devices of the machine, if it was built.
    pub devices: Vec<DeviceReport>,
}

#[derive(Debug, Clone)]
struct MachineSpec {
    sim: SimSpec,
    image: SimImageSpec,
    batches: u32,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            sim: SimSpec::default(),
            image: SimImageSpec::default(),
            batches: 1,
        }
    }
}

impl MachineSpec {
    fn apply(&mut self, setting: &PlatformSetting) {
        match setting {
            PlatformSetting::Sockets(n) => self.sim.sockets = *n,
            PlatformSetting::Cores(n) => self.sim.cores_per_socket = *n,
            PlatformSetting::Threads(n) => self.sim.threads_per_core = *n,
            PlatformSetting::Generation(generation) => self.sim.generation = *generation,
            PlatformSetting::ArrayGeneration(generation) => {
                self.sim.array_generation = *generation;
            }
            PlatformSetting::Batches(n) => self.batches = *n,
            PlatformSetting::Chunks(n) => self.image.chunks = *n,
            PlatformSetting::ChunkSize(n) => self.image.chunk_size = *n,
            PlatformSetting::Version(n) => self.image.version = *n,
            PlatformSetting::MaxBundle(n) => self.image.max_bundle = *n,
            PlatformSetting::Caps(kinds) => self.sim.kinds.clone_from(kinds),
        }
    }
}

/// Simulated machine with one controller per test type.
struct Rig {
    sim: Simulator,
    devices: Vec<(TestKind, Result<TestController, IfsError>)>,
}

impl Rig {
    fn build(machine: &MachineSpec, config: IfsConfig) -> Self {
        let sim = Simulator::new(&machine.sim);
        for batch in 1..=machine.batches {
            sim.firmware.add_image(TestKind::Saf, batch, machine.image);
            sim.firmware.add_image(TestKind::Sbaf, batch, machine.image);
        }
        let platform = sim.platform(config);
        let devices = TestKind::ALL
            .into_iter()
            .map(|kind| (kind, TestController::new(Arc::clone(&platform), kind)))
            .collect();
        info!(
            cpus = sim.topology.cpu_count(),
            sockets = sim.topology.sockets(),
            batches = machine.batches,
            "simulated machine ready"
        );
        Self { sim, devices }
    }

    fn device(&self, kind: TestKind) -> Result<&TestController, String> {
        match self.devices.iter().find(|(k, _)| *k == kind) {
            Some((_, Ok(controller))) => Ok(controller),
            Some((_, Err(error))) => Err(error.to_string()),
            None => Err(IfsError::Unsupported { kind }.to_string()),
        }
    }
}

/// Executes script lines against a lazily built machine.
pub struct Session {
    machine: MachineSpec,
    config: IfsConfig,
    rig: Option<Rig>,
    events: Vec<Event>,
    failures: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Session with the default machine and configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            machine: MachineSpec::default(),
            config: IfsConfig::default(),
            rig: None,
            events: Vec::new(),
            failures: 0,
        }
    }

    /// Events produced so far.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Rejected accesses so far.
    #[must_use]
    pub const fn failures(&self) -> usize {
        self.failures
    }

    fn rig(&mut self) -> &Rig {
        let (machine, config) = (&self.machine, self.config);
        self.rig.get_or_insert_with(|| Rig::build(machine, config))
    }

    fn unbuilt(&self, line: usize, what: &str) -> Result<(), ScriptError> {
        if self.rig.is_some() {
            return Err(ScriptError {
                line,
                message: format!("{what} must come before the machine is used"),
            });
        }
        Ok(())
    }

    /// Executes one line.
    ///
    /// Rejected attribute accesses are recorded as [`Event::Error`] and do
    /// not stop the script.
    ///
    /// # Errors
    ///
    /// Returns a [`ScriptError`] for machine directives after the machine
    /// was built, for machines too large to simulate and for unknown CPUs.
    pub fn execute(&mut self, script_line: &ScriptLine) -> Result<(), ScriptError> {
        let line = script_line.line;
        debug!(line, directive = ?script_line.directive, "executing");
        match &script_line.directive {
            Directive::Platform(settings) => {
                self.unbuilt(line, "platform")?;
                let mut machine = self.machine.clone();
                for setting in settings {
                    machine.apply(setting);
                }
                if machine.sim.cpu_count().is_none() {
                    return Err(ScriptError {
                        line,
                        message: format!("machine exceeds {} cpus", SimSpec::MAX_CPUS),
                    });
                }
                self.machine = machine;
            }
            Directive::Config(settings) => {
                self.unbuilt(line, "config")?;
                for setting in settings {
                    setting.apply(&mut self.config);
                }
            }
            Directive::Offline(cpu) | Directive::Online(cpu) => {
                let online = matches!(script_line.directive, Directive::Online(_));
                if !self.rig().sim.topology.set_online(*cpu, online) {
                    return Err(ScriptError {
                        line,
                        message: format!("unknown cpu {cpu}"),
                    });
                }
            }
            Directive::Fault(fault) => {
                let fault = *fault;
                self.rig().sim.hardware.update_faults(|faults| fault.apply(faults));
            }
            Directive::ClearFaults => self.rig().sim.hardware.clear_faults(),
            Directive::Show { test, attribute } => {
                let outcome = self
                    .rig()
                    .device(*test)
                    .and_then(|controller| {
                        attrs::show(controller, *attribute).map_err(|error| error.to_string())
                    });
                self.record(line, *test, *attribute, outcome.map(|value| (value, true)));
            }
            Directive::Store {
                test,
                attribute,
                value,
            } => {
                let outcome = self.rig().device(*test).and_then(|controller| {
                    attrs::store(controller, *attribute, value).map_err(|error| error.to_string())
                });
                self.record(line, *test, *attribute, outcome.map(|()| (value.clone(), false)));
            }
        }
        Ok(())
    }

    fn record(
        &mut self,
        line: usize,
        test: TestKind,
        attribute: Attribute,
        outcome: Result<(String, bool), String>,
    ) {
        let test = test.name().to_string();
        let attribute = attribute.name().to_string();
        let event = match outcome {
            Ok((value, true)) => Event::Show {
                test,
                attribute,
                value,
            },
            Ok((value, false)) => Event::Store {
                test,
                attribute,
                value,
            },
            Err(message) => {
                self.failures += 1;
                Event::Error {
                    line,
                    test,
                    attribute,
                    message,
                }
            }
        };
        self.events.push(event);
    }

    /// Consumes the session into its report.
    #[must_use]
    pub fn finish(self) -> Report {
        let devices = self
            .rig
            .iter()
            .flat_map(|rig| rig.devices.iter())
            .filter_map(|(_, device)| device.as_ref().ok())
            .map(DeviceReport::of)
            .collect();
        Report {
            events: self.events,
            failures: self.failures,
            devices,
        }
    }
}

/// Parses and executes a whole script.
///
/// # Errors
///
/// Returns the first [`ScriptError`]; attribute failures are reported in the
/// returned [`Report`] instead.
pub fn run_script(text: &str) -> Result<Report, ScriptError> {
    let lines = parse_script(text)?;
    let mut session = Session::new();
    for line in &lines {
        session.execute(line)?;
    }
    Ok(session.finish())
}
