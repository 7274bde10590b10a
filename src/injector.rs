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

//! Injector backends. A backend installs one bit-flip described by a
//! [`FaultSpec`] and runs the program to completion, reporting what the
//! program and the injection tooling did.

use log::debug;

use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{CampaignConfig, SCRIPT_EXTENSION};
use crate::orchestrate::{self, ProcessOutput};
use crate::script;
use crate::selector::FaultSpec;

#[derive(Clone, Debug)]
pub struct TrialOutput {
    /// The program under test, as run inside the simulator.
    pub program: ProcessOutput,
    /// The injection tooling.
    pub injector: ProcessOutput,
}

pub trait InjectorBackend {
    /// Install a bit-flip at (address, occurrence, register, mask) and run
    /// the program to completion. `index` identifies the trial for any
    /// files the backend leaves behind.
    fn run_trial(&mut self, spec: &FaultSpec, index: usize) -> Result<TrialOutput, Box<dyn Error>>;
}

/// Runs the program inside the instruction simulator with its debug stub
/// enabled, and drives the fault through a debugger attached to that stub.
pub struct DebuggerBackend<'c> {
    config: &'c CampaignConfig,
}

fn shell(command_line: String) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(command_line);
    command
}

fn remove_scratch(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

impl<'c> DebuggerBackend<'c> {
    pub fn new(config: &'c CampaignConfig) -> Self {
        DebuggerBackend { config }
    }

    pub fn simulator_command_line(&self) -> String {
        let c = self.config;
        format!(
            "{} -rtm-mode {} -debug -debug-port {} -- {} {}",
            c.sde,
            c.rtm_mode,
            c.debug_port,
            c.program.display(),
            c.arguments
        )
    }

    pub fn debugger_command_line(&self, script: &Path) -> String {
        let c = self.config;
        format!("{} --batch --command={} --args {} {}", c.gdb, script.display(), c.program.display(), c.arguments)
    }

    pub fn script_path(&self, index: usize) -> PathBuf {
        self.config.trial_path(index, SCRIPT_EXTENSION)
    }
}

impl<'c> InjectorBackend for DebuggerBackend<'c> {
    fn run_trial(&mut self, spec: &FaultSpec, index: usize) -> Result<TrialOutput, Box<dyn Error>> {
        let script_path = self.script_path(index);
        script::write_script(&script_path, spec, self.config.debug_port)?;

        if let Some(scratch) = &self.config.scratch_dir {
            remove_scratch(scratch)?;
        }

        let simulator = self.simulator_command_line();
        let debugger = self.debugger_command_line(&script_path);
        debug!("Simulator: {}", simulator);
        debug!("Debugger: {}", debugger);

        let (program, injector) = orchestrate::run_pair(&mut shell(simulator), &mut shell(debugger), self.config.timing)?;
        Ok(TrialOutput { program, injector })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_args, Parsed};

    fn config(line: &str) -> CampaignConfig {
        let args: Vec<String> = line.split_whitespace().map(String::from).collect();
        match parse_args(&args, |_| None) {
            Ok(Parsed::Run(config)) => config,
            _ => panic!("bad test configuration"),
        }
    }

    #[test]
    fn command_lines() {
        let mut c = config("-p ./bench/wc -d t -m full -r r -o 10001 --sde sde64 --gdb gdb");
        c.arguments = String::from("-l < input.txt");
        let backend = DebuggerBackend::new(&c);
        assert_eq!(
            backend.simulator_command_line(),
            "sde64 -rtm-mode full -debug -debug-port 10001 -- ./bench/wc -l < input.txt"
        );
        let script = backend.script_path(3);
        assert_eq!(script, PathBuf::from("logs/wc_000003.gdbscript"));
        assert_eq!(
            backend.debugger_command_line(&script),
            "gdb --batch --command=logs/wc_000003.gdbscript --args ./bench/wc -l < input.txt"
        );
    }

    #[test]
    fn scratch_removal_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("tmp");
        assert!(remove_scratch(&scratch).is_ok());
        fs::create_dir_all(scratch.join("nested")).unwrap();
        fs::write(scratch.join("nested/file"), "x").unwrap();
        remove_scratch(&scratch).unwrap();
        assert!(!scratch.exists());
    }
}
