//! CLI entry point for the `ifs-ctl` binary.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use ifs_core as _;
use ifs_ctl::script::{parse_script, Session};
use serde as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber::EnvFilter;
#[cfg(test)]
use tempfile as _;

const USAGE_TEXT: &str = "\
Usage: ifs-ctl <command> [options]

Commands:
  run <script> [--json] [--verbose]  Execute a driver script against the simulator

Options:
  -j, --json     Print a JSON report instead of attribute lines
  -v, --verbose  Log protocol activity to stderr
  -h, --help     Show this help message

Script lines:
  platform key=value...    sockets cores threads generation array-generation
                           batches chunks chunk-size version max-bundle caps
  config key=value...      max-restarts run-timeout-ms rendezvous-timeout-ms
                           thread-wait-delay sigmce eager-load auth-attempts
  offline <cpu> | online <cpu>
  fault <kind> key=value... | fault clear
  <saf|array|sbaf> <attribute>[=<value>]

Examples:
  ifs-ctl run smoke.ifs
  ifs-ctl run smoke.ifs --json
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(RunArgs),
}

#[derive(Debug, PartialEq, Eq)]
struct RunArgs {
    script: PathBuf,
    json: bool,
    verbose: bool,
}

#[derive(Debug)]
enum ParseResult {
    Command(Command),
    Help,
}

fn parse_args(mut args: impl Iterator<Item = OsString>) -> Result<ParseResult, String> {
    let first = args.next().ok_or_else(|| "missing command".to_string())?;

    if first == "--help" || first == "-h" {
        return Ok(ParseResult::Help);
    }

    let command_str = first.to_string_lossy().to_string();

    match command_str.as_str() {
        "run" => parse_run_args(args)
            .map(Command::Run)
            .map(ParseResult::Command),
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_run_args(args: impl Iterator<Item = OsString>) -> Result<RunArgs, String> {
    let mut script: Option<PathBuf> = None;
    let mut json = false;
    let mut verbose = false;

    for arg in args {
        if arg == "--help" || arg == "-h" {
            return Err(USAGE_TEXT.to_string());
        }

        if arg == "--json" || arg == "-j" {
            json = true;
            continue;
        }

        if arg == "--verbose" || arg == "-v" {
            verbose = true;
            continue;
        }

        if arg.to_string_lossy().starts_with('-') {
            return Err(format!("unknown option: {}", arg.to_string_lossy()));
        }

        if script.is_some() {
            return Err("multiple script paths provided".to_string());
        }
        script = Some(PathBuf::from(arg));
    }

    let script = script.ok_or_else(|| "missing script path".to_string())?;
    Ok(RunArgs {
        script,
        json,
        verbose,
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("warning: logging unavailable: {error}");
    }
}

fn run_script_file(args: &RunArgs) -> Result<(), i32> {
    let text = match fs::read_to_string(&args.script) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: failed to read {}: {e}", args.script.display());
            return Err(1);
        }
    };

    let lines = match parse_script(&text) {
        Ok(lines) => lines,
        Err(e) => {
            eprintln!("{}: error: {e}", args.script.display());
            return Err(1);
        }
    };

    let mut session = Session::new();
    let mut printed = 0;
    for line in &lines {
        if let Err(e) = session.execute(line) {
            eprintln!("{}: error: {e}", args.script.display());
            return Err(1);
        }
        if !args.json {
            for event in &session.events()[printed..] {
                if event.is_error() {
                    eprintln!("{event}");
                } else if matches!(event, ifs_ctl::script::Event::Show { .. }) {
                    println!("{event}");
                }
            }
        }
        printed = session.events().len();
    }

    let report = session.finish();
    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: failed to encode report: {e}");
                return Err(1);
            }
        }
    }

    if report.failures == 0 {
        Ok(())
    } else {
        Err(1)
    }
}

fn main() {
    let exit_code = match parse_args(env::args_os().skip(1)) {
        Ok(ParseResult::Help) => {
            println!("{USAGE_TEXT}");
            0
        }
        Ok(ParseResult::Command(Command::Run(args))) => {
            init_logging(args.verbose);
            match run_script_file(&args) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Err(error) => {
            if error.starts_with("Usage:") {
                println!("{error}");
            } else {
                eprintln!("error: {error}");
                eprintln!("{USAGE_TEXT}");
            }
            1
        }
    };

    std::process::exit(exit_code);
}
