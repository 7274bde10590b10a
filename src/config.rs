// BSD 2-Clause License
//
// Copyright (c) 2020 Brian Campbell
// Copyright (c) 2020 Alasdair Armstrong
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Command line surface and the immutable campaign configuration built
//! from it.

use getopts::{Matches, Options};

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrate::Timing;
use crate::output::{Comparison, Stream};
use crate::registers::RegisterSet;

pub const DEFAULT_RUNS: usize = 100;
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_MAX_TRIES: usize = 3;
pub const DEFAULT_DEBUG_PORT: u16 = 10000;
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 2;
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_SCRATCH_DIR: &str = "tmp";
pub const DEFAULT_SDE: &str = "sde64";
pub const DEFAULT_GDB: &str = "gdb";

pub const SCRIPT_EXTENSION: &str = "gdbscript";
pub const SIMULATOR_LOG_EXTENSION: &str = "sdelog";
pub const DEBUGGER_LOG_EXTENSION: &str = "gdblog";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtmMode {
    Full,
    Nop,
}

impl FromStr for RtmMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RtmMode::Full),
            "nop" => Ok(RtmMode::Nop),
            _ => Err(format!("Bad RTM mode: {} (expected full or nop)", s)),
        }
    }
}

impl fmt::Display for RtmMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RtmMode::Full => "full",
                RtmMode::Nop => "nop",
            }
        )
    }
}

#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct CampaignConfig {
    pub program: PathBuf,
    /// Handed to the shell as is, so redirections work.
    pub arguments: String,
    pub dyntrace: PathBuf,
    pub rtm_mode: RtmMode,
    pub reference: PathBuf,
    pub comparison: Comparison,
    pub log_dir: PathBuf,
    pub debug_port: u16,
    pub inject_flags: bool,
    pub runs: usize,
    pub max_tries: usize,
    pub timing: Timing,
    pub sde: String,
    pub gdb: String,
    pub scratch_dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub ptrace_setup: bool,
}

impl CampaignConfig {
    pub fn registers(&self) -> RegisterSet {
        RegisterSet::new(self.inject_flags)
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("program"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.program_name()))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.info", self.program_name()))
    }

    pub fn trial_path(&self, index: usize, extension: &str) -> PathBuf {
        self.log_dir.join(format!("{}_{:06}.{}", self.program_name(), index, extension))
    }
}

pub fn options() -> Options {
    let mut opts = Options::new();
    opts.optopt("p", "program", "program under test", "<file>");
    opts.optopt("a", "arguments", "arguments of the program under test", "<args>");
    opts.optopt("d", "dyntrace", "dynamic trace of the program obtained with the simulator", "<file>");
    opts.optopt("m", "rtmmode", "RTM mode passed to the simulator", "full/nop");
    opts.optopt("r", "refoutput", "reference output file", "<file>");
    opts.optopt("b", "binaryoutput", "binary output file written by the program; compared by digest", "<file>");
    opts.optflag("s", "sortoutput", "sort output lines before comparison");
    opts.optopt("l", "logdir", "directory for the ledger and per-run logs", "<dir>");
    opts.optopt("o", "debugport", "debug port of the simulator's stub", "<port>");
    opts.optflag("e", "erroroutput", "compare stderr instead of stdout");
    opts.optflag("f", "injecteflags", "also inject into the flags register");
    opts.optopt("n", "runs", "number of fault injection runs (LIMIT, 100 default)", "<number>");
    opts.optopt("t", "timeout", "deadline for one run in seconds (3600 default)", "<seconds>");
    opts.optopt("", "max-tries", "attempts per run when the tooling fails (3 default)", "<number>");
    opts.optopt("", "startup-delay", "seconds to wait for the debug stub (2 default)", "<seconds>");
    opts.optopt("", "sde", "simulator executable (SDE, sde64 default)", "<file>");
    opts.optopt("", "gdb", "debugger executable (GDB, gdb default)", "<file>");
    opts.optopt("", "scratch-dir", "directory removed before every run (tmp default)", "<dir>");
    opts.optflag("", "keep-scratch", "do not remove the scratch directory");
    opts.optopt("", "seed", "seed for a reproducible campaign", "<number>");
    opts.optflag("", "no-ptrace-setup", "do not lower the ptrace restriction");
    opts.optflag("h", "help", "print this help message");
    opts
}

pub enum Parsed {
    Help(String),
    Run(CampaignConfig),
}

fn required(matches: &Matches, name: &str) -> Result<String, ConfigError> {
    matches.opt_str(name).ok_or_else(|| ConfigError(format!("Missing required option --{}", name)))
}

fn number<T: FromStr>(matches: &Matches, name: &str, default: T) -> Result<T, ConfigError> {
    matches.opt_get_default(name, default).map_err(|_| ConfigError(format!("Bad --{} argument", name)))
}

/// Parse the command line (without the program name). `env` looks up
/// environment variables, which supply some defaults.
pub fn parse_args<E>(args: &[String], env: E) -> Result<Parsed, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let opts = options();
    let matches = opts.parse(args).map_err(|err| ConfigError(err.to_string()))?;
    if matches.opt_present("help") {
        return Ok(Parsed::Help(opts.usage("Usage: rtm-fi -p <program> -d <trace> -m <mode> -r <reference> [options]")));
    }

    let program = PathBuf::from(required(&matches, "program")?);
    let dyntrace = PathBuf::from(required(&matches, "dyntrace")?);
    let rtm_mode = required(&matches, "rtmmode")?.parse::<RtmMode>().map_err(ConfigError)?;
    let reference = PathBuf::from(required(&matches, "refoutput")?);

    let sort = matches.opt_present("sortoutput");
    let stream = if matches.opt_present("erroroutput") { Stream::Stderr } else { Stream::Stdout };
    let comparison = match matches.opt_str("binaryoutput") {
        Some(_) if sort => return Err(ConfigError(String::from("--binaryoutput and --sortoutput are mutually exclusive"))),
        Some(artifact) => Comparison::Binary { artifact: PathBuf::from(artifact) },
        None => Comparison::Text { stream, sort },
    };

    let default_runs = match env("LIMIT") {
        Some(limit) => limit.trim().parse().map_err(|_| ConfigError(format!("Bad LIMIT value: {}", limit)))?,
        None => DEFAULT_RUNS,
    };
    let runs = number(&matches, "runs", default_runs)?;
    let max_tries = number(&matches, "max-tries", DEFAULT_MAX_TRIES)?;
    if runs == 0 || max_tries == 0 {
        return Err(ConfigError(String::from("--runs and --max-tries must be at least 1")));
    }

    let timeout = number(&matches, "timeout", DEFAULT_TIMEOUT_SECS)?;
    if timeout == 0 {
        return Err(ConfigError(String::from("--timeout must be at least 1 second")));
    }
    let startup_delay = number(&matches, "startup-delay", DEFAULT_STARTUP_DELAY_SECS)?;
    if startup_delay >= timeout {
        return Err(ConfigError(String::from("--startup-delay must be shorter than --timeout")));
    }
    let timing = Timing { startup_delay: Duration::from_secs(startup_delay), timeout: Duration::from_secs(timeout) };

    let scratch_dir = if matches.opt_present("keep-scratch") {
        None
    } else {
        Some(PathBuf::from(matches.opt_str("scratch-dir").unwrap_or_else(|| DEFAULT_SCRATCH_DIR.to_string())))
    };

    let seed = match matches.opt_str("seed") {
        Some(seed) => Some(seed.parse().map_err(|_| ConfigError(format!("Bad --seed argument: {}", seed)))?),
        None => None,
    };

    Ok(Parsed::Run(CampaignConfig {
        program,
        arguments: matches.opt_str("arguments").unwrap_or_default(),
        dyntrace,
        rtm_mode,
        reference,
        comparison,
        log_dir: PathBuf::from(matches.opt_str("logdir").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
        debug_port: number(&matches, "debugport", DEFAULT_DEBUG_PORT)?,
        inject_flags: matches.opt_present("injecteflags"),
        runs,
        max_tries,
        timing,
        sde: matches.opt_str("sde").or_else(|| env("SDE")).unwrap_or_else(|| DEFAULT_SDE.to_string()),
        gdb: matches.opt_str("gdb").or_else(|| env("GDB")).unwrap_or_else(|| DEFAULT_GDB.to_string()),
        scratch_dir,
        seed,
        ptrace_setup: !matches.opt_present("no-ptrace-setup"),
    }))
}

pub fn ensure_log_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir)
        .map_err(|err| ConfigError(format!("Unable to create log directory {}: {}", dir.display(), err)))
}
