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

//! The campaign loop: one fault per index, retried while the injection
//! tooling rather than the program is at fault, with every finished index
//! recorded in the ledger.

use log::{debug, info, warn};
use rand::Rng;

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::classify::{classify, Outcome};
use crate::config::{self, CampaignConfig, DEBUGGER_LOG_EXTENSION, SIMULATOR_LOG_EXTENSION};
use crate::injector::{InjectorBackend, TrialOutput};
use crate::output::ReferenceOutput;
use crate::selector::select_fault;
use crate::trace::{self, SiteTable};

pub const PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

#[derive(Debug)]
pub enum CampaignError {
    NoInjectableSite,
    Ledger(PathBuf, io::Error),
}

impl fmt::Display for CampaignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampaignError::NoInjectableSite => write!(f, "No instruction in the site table has a successor to break on"),
            CampaignError::Ledger(path, err) => write!(f, "Unable to write {}: {}", path.display(), err),
        }
    }
}
impl Error for CampaignError {}

/// What the ledger says about one index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LedgerEntry {
    Completed(Outcome),
    /// Every attempt failed in the injection tooling.
    Incomplete,
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerEntry::Completed(outcome) => write!(f, "{}", outcome),
            LedgerEntry::Incomplete => write!(f, "INCOMPLETE"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunRecord {
    pub index: usize,
    pub entry: LedgerEntry,
    pub attempts: usize,
    pub simulator_log: PathBuf,
    pub debugger_log: PathBuf,
}

/// Everything a campaign reads: built once before the first trial and
/// never modified afterwards.
pub struct CampaignContext {
    pub config: CampaignConfig,
    pub sites: SiteTable,
    pub reference: ReferenceOutput,
}

impl CampaignContext {
    pub fn new(config: CampaignConfig, sites: SiteTable, reference: ReferenceOutput) -> Self {
        CampaignContext { config, sites, reference }
    }

    /// Load the reference output and analyze the trace. Either failing is
    /// fatal for the campaign.
    pub fn prepare(config: CampaignConfig) -> Result<Self, Box<dyn Error>> {
        let reference = ReferenceOutput::load(&config.reference, &config.comparison)?;
        let sites = trace::analyze_file(&config.dyntrace, &config.registers())?;
        info!("Found {} injectable instructions in {} thread(s)", sites.len(), sites.threads_examined());
        config::ensure_log_dir(&config.log_dir)?;
        Ok(CampaignContext::new(config, sites, reference))
    }

    fn write_summary(&self) -> io::Result<()> {
        let c = &self.config;
        let mut f = File::create(c.summary_path())?;
        writeln!(f, "----- info -----")?;
        writeln!(f, "    program: {}", c.program.display())?;
        writeln!(f, "       args: {}", c.arguments)?;
        writeln!(f)?;
        writeln!(f, " ref output: {}", c.reference.display())?;
        writeln!(f, " comparison: {}", c.comparison)?;
        writeln!(f, "  dyn trace: {}", c.dyntrace.display())?;
        writeln!(f, "   rtm mode: {}", c.rtm_mode)?;
        writeln!(f, "      flags: {}", if c.inject_flags { "injected" } else { "not injected" })?;
        writeln!(f)?;
        writeln!(f, " debug port: {}", c.debug_port)?;
        writeln!(f, "       runs: {}", c.runs)?;
        writeln!(f, "  max tries: {}", c.max_tries)?;
        writeln!(f, "    timeout: {}s", c.timing.timeout.as_secs())?;
        match c.seed {
            Some(seed) => writeln!(f, "       seed: {}", seed)?,
            None => writeln!(f, "       seed: random")?,
        }
        writeln!(f)?;
        writeln!(f, "      sites: {}", self.sites.len())?;
        writeln!(f, "    threads: {}", self.sites.threads_examined())?;
        Ok(())
    }
}

pub struct Campaign<'a, B, R> {
    context: &'a CampaignContext,
    backend: B,
    rng: R,
}

fn write_file(path: &Path, contents: &str) -> Result<(), CampaignError> {
    fs::write(path, contents).map_err(|err| CampaignError::Ledger(path.to_path_buf(), err))
}

impl<'a, B: InjectorBackend, R: Rng> Campaign<'a, B, R> {
    pub fn new(context: &'a CampaignContext, backend: B, rng: R) -> Self {
        Campaign { context, backend, rng }
    }

    /// Run every index in turn. The ledger is truncated first, so it always
    /// ends up with one line per index.
    pub fn run(&mut self) -> Result<Vec<RunRecord>, Box<dyn Error>> {
        let context = self.context;
        let config = &context.config;
        context
            .write_summary()
            .map_err(|err| CampaignError::Ledger(config.summary_path(), err))?;
        let ledger = config.ledger_path();
        File::create(&ledger).map_err(|err| CampaignError::Ledger(ledger.clone(), err))?;

        let mut records = Vec::with_capacity(config.runs);
        for index in 0..config.runs {
            let record = self.run_index(index)?;
            self.append_ledger(&record)?;
            info!("Run {:06}: {} after {} attempt(s)", index, record.entry, record.attempts);
            records.push(record);
        }
        Ok(records)
    }

    fn append_ledger(&self, record: &RunRecord) -> Result<(), CampaignError> {
        let path = self.context.config.ledger_path();
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{:06}   {:>6}", record.index, record.entry.to_string()))
            .map_err(|err| CampaignError::Ledger(path, err))
    }

    fn write_logs(&self, index: usize, output: &TrialOutput) -> Result<(PathBuf, PathBuf), CampaignError> {
        let config = &self.context.config;
        let simulator_log = config.trial_path(index, SIMULATOR_LOG_EXTENSION);
        let debugger_log = config.trial_path(index, DEBUGGER_LOG_EXTENSION);
        write_file(&simulator_log, &output.program.report())?;
        write_file(&debugger_log, &output.injector.report())?;
        Ok((simulator_log, debugger_log))
    }

    /// One index: draw a fresh fault for every attempt until a trial ends in
    /// something other than an instrumentation failure.
    pub fn run_index(&mut self, index: usize) -> Result<RunRecord, Box<dyn Error>> {
        let context = self.context;
        let max_tries = context.config.max_tries;
        let mut last = None;

        for attempt in 1..=max_tries {
            let spec = select_fault(&context.sites, &mut self.rng).ok_or(CampaignError::NoInjectableSite)?;
            debug!("Run {:06} attempt {}: {}", index, attempt, spec);

            let output = self.backend.run_trial(&spec, index)?;
            let outcome = classify(&output.program, &output.injector, &context.config.comparison, &context.reference);
            if outcome == Outcome::Hang {
                warn!("Run {:06} hit the {}s deadline", index, context.config.timing.timeout.as_secs());
            }

            if outcome.is_instrumentation_failure() {
                warn!("Run {:06} attempt {} failed in the tooling ({}), retrying", index, attempt, outcome);
                last = Some(output);
                continue;
            }

            let (simulator_log, debugger_log) = self.write_logs(index, &output)?;
            return Ok(RunRecord {
                index,
                entry: LedgerEntry::Completed(outcome),
                attempts: attempt,
                simulator_log,
                debugger_log,
            });
        }

        warn!("Run {:06} gave up after {} attempts", index, max_tries);
        let config = &context.config;
        let (simulator_log, debugger_log) = match last {
            Some(output) => self.write_logs(index, &output)?,
            None => (config.trial_path(index, SIMULATOR_LOG_EXTENSION), config.trial_path(index, DEBUGGER_LOG_EXTENSION)),
        };
        Ok(RunRecord { index, entry: LedgerEntry::Incomplete, attempts: max_tries, simulator_log, debugger_log })
    }
}

/// Count ledger entries, for the report printed at the end of a campaign.
pub fn tally(records: &[RunRecord]) -> BTreeMap<LedgerEntry, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.entry).or_insert(0) += 1;
    }
    counts
}

/// The debugger has to attach to the simulator, which the Yama ptrace
/// restriction forbids unless it is lowered to 0.
pub fn lower_ptrace_scope() -> io::Result<()> {
    match fs::read_to_string(PTRACE_SCOPE) {
        Ok(scope) if scope.trim() == "0" => return Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        _ => (),
    }
    info!("Changing ptrace_scope to 0");
    if fs::write(PTRACE_SCOPE, "0\n").is_ok() {
        return Ok(());
    }

    let mut child = Command::new("sudo")
        .args(&["tee", PTRACE_SCOPE])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(b"0\n")?;
    }
    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("sudo tee {} failed: {}", PTRACE_SCOPE, status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_entry_tags() {
        assert_eq!(LedgerEntry::Completed(Outcome::Sdc).to_string(), "SDC");
        assert_eq!(LedgerEntry::Incomplete.to_string(), "INCOMPLETE");
    }

    #[test]
    fn tally_counts() {
        let record = |index, entry| RunRecord {
            index,
            entry,
            attempts: 1,
            simulator_log: PathBuf::new(),
            debugger_log: PathBuf::new(),
        };
        let records = vec![
            record(0, LedgerEntry::Completed(Outcome::Masked)),
            record(1, LedgerEntry::Completed(Outcome::Sdc)),
            record(2, LedgerEntry::Completed(Outcome::Masked)),
            record(3, LedgerEntry::Incomplete),
        ];
        let counts = tally(&records);
        assert_eq!(counts[&LedgerEntry::Completed(Outcome::Masked)], 2);
        assert_eq!(counts[&LedgerEntry::Completed(Outcome::Sdc)], 1);
        assert_eq!(counts[&LedgerEntry::Incomplete], 1);
    }
}
