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

//! Maps the two processes' results onto the outcome taxonomy.

use log::warn;

use std::fmt;

use crate::orchestrate::{ProcessOutput, Status};
use crate::output::{effective_output, Comparison, ReferenceOutput};

/// Exit code the hardened program uses to report a detected fault.
pub const SWIFT_EXIT_CODE: i32 = 2;
/// Exit code of the simulator when the debug stub cannot be set up.
pub const DEBUGGER_CONNECTION_EXIT_CODE: i32 = 255;
pub const DEBUGGER_CONNECTION_MESSAGE: &str = "E: Unable to create debugger connection";
/// Generic failure code shared by program crashes and simulator crashes.
pub const FAILURE_EXIT_CODE: i32 = 1;
pub const SIMULATOR_ERROR_MARKER: &str = "SDE PINTOOL EXITNOW ERROR";
pub const UNALIGNED_ACCESS_MESSAGE: &str = "unaligned memory reference";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    /// The deadline expired.
    Hang,
    /// The debugger failed.
    Gdb,
    /// The program detected the fault and aborted.
    Swift,
    /// The simulator itself crashed.
    Sde,
    Os,
    /// The program crashed.
    Prog,
    Masked,
    /// Silent data corruption.
    Sdc,
}

impl Outcome {
    pub const ALL: [Outcome; 8] = [
        Outcome::Hang,
        Outcome::Gdb,
        Outcome::Swift,
        Outcome::Sde,
        Outcome::Os,
        Outcome::Prog,
        Outcome::Masked,
        Outcome::Sdc,
    ];

    /// Failures of the injection tooling rather than of the program; these
    /// trials are retried and never reach the ledger.
    pub fn is_instrumentation_failure(self) -> bool {
        matches!(self, Outcome::Sde | Outcome::Gdb)
    }

    pub fn tag(self) -> &'static str {
        use Outcome::*;
        match self {
            Hang => "HANG",
            Gdb => "GDB",
            Swift => "SWIFT",
            Sde => "SDE",
            Os => "OS",
            Prog => "PROG",
            Masked => "MASKED",
            Sdc => "SDC",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

fn classify_failure(code: Option<i32>, simulator: &ProcessOutput) -> Outcome {
    match code {
        Some(SWIFT_EXIT_CODE) => Outcome::Swift,
        Some(DEBUGGER_CONNECTION_EXIT_CODE) if simulator.stdout.starts_with(DEBUGGER_CONNECTION_MESSAGE.as_bytes()) => {
            Outcome::Gdb
        }
        Some(FAILURE_EXIT_CODE) => {
            let stderr = simulator.stderr_lossy();
            if stderr.contains(SIMULATOR_ERROR_MARKER) {
                Outcome::Sde
            } else if stderr.contains(UNALIGNED_ACCESS_MESSAGE) {
                Outcome::Os
            } else {
                Outcome::Prog
            }
        }
        _ => Outcome::Os,
    }
}

pub fn classify(
    simulator: &ProcessOutput,
    debugger: &ProcessOutput,
    comparison: &Comparison,
    reference: &ReferenceOutput,
) -> Outcome {
    if simulator.is_timeout() || debugger.is_timeout() {
        return Outcome::Hang;
    }
    if !debugger.status.success() {
        return Outcome::Gdb;
    }
    match simulator.status {
        Status::Code(0) => (),
        Status::Code(code) => return classify_failure(Some(code), simulator),
        Status::Signal(_) | Status::TimedOut => return classify_failure(None, simulator),
    }

    match effective_output(comparison, &simulator.stdout, &simulator.stderr) {
        Ok(output) if output == reference.as_bytes() => Outcome::Masked,
        Ok(_) => Outcome::Sdc,
        Err(err) => {
            warn!("Program exited cleanly but its output could not be read: {}", err);
            Outcome::Sdc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Stream;

    const STDOUT: Comparison = Comparison::Text { stream: Stream::Stdout, sort: false };

    fn process(status: Status, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput { status, stdout: stdout.as_bytes().to_vec(), stderr: stderr.as_bytes().to_vec() }
    }

    fn clean() -> ProcessOutput {
        process(Status::Code(0), "", "")
    }

    fn reference() -> ReferenceOutput {
        ReferenceOutput::from_contents(b"sum = 42\n", &STDOUT)
    }

    fn run(simulator: ProcessOutput, debugger: ProcessOutput) -> Outcome {
        classify(&simulator, &debugger, &STDOUT, &reference())
    }

    const BANNER: &str = "sde 1\nsde 2\nsde 3\n";

    #[test]
    fn masked_and_sdc() {
        let good = format!("{}sum = 42\n", BANNER);
        assert_eq!(run(process(Status::Code(0), &good, ""), clean()), Outcome::Masked);
        let bad = format!("{}sum = 43\n", BANNER);
        assert_eq!(run(process(Status::Code(0), &bad, ""), clean()), Outcome::Sdc);
    }

    #[test]
    fn timeout_wins() {
        assert_eq!(run(ProcessOutput::timed_out(), ProcessOutput::timed_out()), Outcome::Hang);
        assert_eq!(run(process(Status::Code(1), "", ""), ProcessOutput::timed_out()), Outcome::Hang);
    }

    #[test]
    fn debugger_failure_before_program() {
        assert_eq!(run(process(Status::Code(2), "", ""), process(Status::Code(1), "", "")), Outcome::Gdb);
        assert_eq!(run(clean(), process(Status::Signal(11), "", "")), Outcome::Gdb);
    }

    #[test]
    fn program_failures() {
        assert_eq!(run(process(Status::Code(2), "", ""), clean()), Outcome::Swift);
        assert_eq!(
            run(process(Status::Code(255), "E: Unable to create debugger connection\n", ""), clean()),
            Outcome::Gdb
        );
        assert_eq!(run(process(Status::Code(255), "something else", ""), clean()), Outcome::Os);
        assert_eq!(run(process(Status::Code(1), "", "SDE PINTOOL EXITNOW ERROR: x"), clean()), Outcome::Sde);
        assert_eq!(run(process(Status::Code(1), "", "unaligned memory reference at 0x7"), clean()), Outcome::Os);
        assert_eq!(run(process(Status::Code(1), "", "Segmentation fault"), clean()), Outcome::Prog);
        assert_eq!(run(process(Status::Code(139), "", ""), clean()), Outcome::Os);
        assert_eq!(run(process(Status::Signal(9), "", ""), clean()), Outcome::Os);
    }

    #[test]
    fn instrumentation_failures() {
        let retried: Vec<Outcome> = Outcome::ALL.iter().copied().filter(|o| o.is_instrumentation_failure()).collect();
        assert_eq!(retried, vec![Outcome::Gdb, Outcome::Sde]);
    }

    #[test]
    fn every_combination_classified() {
        let statuses =
            [Status::Code(0), Status::Code(1), Status::Code(2), Status::Code(255), Status::Code(7), Status::Signal(6), Status::TimedOut];
        let messages = ["", "E: Unable to create debugger connection", "SDE PINTOOL EXITNOW ERROR", "unaligned memory reference"];
        for sim_status in statuses.iter() {
            for gdb_status in statuses.iter() {
                for message in messages.iter() {
                    let simulator = process(*sim_status, message, message);
                    let debugger = process(*gdb_status, "", "");
                    let outcome = run(simulator, debugger);
                    assert!(Outcome::ALL.contains(&outcome));
                }
            }
        }
    }
}
