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

//! Runs the simulator and the debugger side by side under one wall-clock
//! deadline. Each child leads its own process group so that a timeout
//! takes down everything it spawned.

use crossbeam::channel::{unbounded, RecvTimeoutError};

use std::error::Error;
use std::fmt;
use std::io;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How long killed children get to be reaped before they are abandoned.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Code(i32),
    Signal(i32),
    TimedOut,
}

impl Status {
    pub fn success(self) -> bool {
        self == Status::Code(0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Code(code) => write!(f, "{}", code),
            Status::Signal(signal) => write!(f, "signal {}", signal),
            Status::TimedOut => write!(f, "timeout"),
        }
    }
}

impl From<std::process::ExitStatus> for Status {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Status::Code(code),
            (None, Some(signal)) => Status::Signal(signal),
            (None, None) => Status::Code(-1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: Status,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn timed_out() -> Self {
        ProcessOutput { status: Status::TimedOut, stdout: Vec::new(), stderr: Vec::new() }
    }

    pub fn is_timeout(&self) -> bool {
        self.status == Status::TimedOut
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// The per-trial log format: return code, then stderr, then stdout.
    pub fn report(&self) -> String {
        format!(
            "[return code: {}]\n\n---------- stderr ----------\n{}\n\n---------- stdout ----------\n{}",
            self.status,
            self.stderr_lossy(),
            self.stdout_lossy()
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Timing {
    /// Pause between launching the simulator and the debugger, so the
    /// debug stub is listening.
    pub startup_delay: Duration,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct OrchestrateError(String);

impl fmt::Display for OrchestrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Error for OrchestrateError {}

fn spawn_in_group(command: &mut Command) -> io::Result<Child> {
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).process_group(0).spawn()
}

fn kill_group(pid: u32) {
    // The group may already be gone, which is fine.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

fn read_all<R: Read>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

/// Drain both pipes then reap the child.
fn collect(mut child: Child) -> io::Result<ProcessOutput> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = crossbeam::scope(|s| {
        let err_reader = s.spawn(move |_| read_all(stderr));
        let out = read_all(stdout);
        let err = err_reader.join().unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "stderr reader panicked")));
        (out, err)
    })
    .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe reader panicked"))?;
    let status = child.wait()?;
    Ok(ProcessOutput { status: status.into(), stdout: stdout?, stderr: stderr? })
}

/// Process groups whose output has not been collected yet. A group whose
/// leader was already reaped may have had its id recycled.
fn live_groups(outputs: &[Option<io::Result<ProcessOutput>>; 2], pids: [u32; 2]) -> Vec<u32> {
    outputs.iter().zip(pids.iter()).filter(|(output, _)| output.is_none()).map(|(_, pid)| *pid).collect()
}

/// Launch `first`, wait `startup_delay`, launch `second`, then wait for both
/// to exit. If the deadline passes first both process groups are killed and
/// both outputs are reported as timed out.
pub fn run_pair(
    first: &mut Command,
    second: &mut Command,
    timing: Timing,
) -> Result<(ProcessOutput, ProcessOutput), OrchestrateError> {
    let start = Instant::now();
    let first_child =
        spawn_in_group(first).map_err(|err| OrchestrateError(format!("Failed to launch {:?}: {}", first, err)))?;
    let first_pid = first_child.id();

    thread::sleep(timing.startup_delay);

    if start.elapsed() >= timing.timeout {
        kill_group(first_pid);
        let _ = collect(first_child);
        return Ok((ProcessOutput::timed_out(), ProcessOutput::timed_out()));
    }

    let second_child = match spawn_in_group(second) {
        Ok(child) => child,
        Err(err) => {
            kill_group(first_pid);
            let _ = collect(first_child);
            return Err(OrchestrateError(format!("Failed to launch {:?}: {}", second, err)));
        }
    };
    let second_pid = second_child.id();

    let (tx, rx) = unbounded();
    for (slot, child) in vec![first_child, second_child].into_iter().enumerate() {
        let tx = tx.clone();
        thread::spawn(move || {
            let _ = tx.send((slot, collect(child)));
        });
    }
    drop(tx);

    let deadline = start + timing.timeout;
    let mut outputs: [Option<io::Result<ProcessOutput>>; 2] = [None, None];
    let mut pending = 2;
    let mut timed_out = false;
    while pending > 0 {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            break;
        }
        match rx.recv_timeout(deadline - now) {
            Ok((slot, output)) => {
                outputs[slot] = Some(output);
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if timed_out {
        for pid in live_groups(&outputs, [first_pid, second_pid]).into_iter().rev() {
            kill_group(pid);
        }
        while pending > 0 && rx.recv_timeout(REAP_GRACE).is_ok() {
            pending -= 1;
        }
        return Ok((ProcessOutput::timed_out(), ProcessOutput::timed_out()));
    }

    let [first_output, second_output] = outputs;
    let finished = |output: Option<io::Result<ProcessOutput>>, pid: u32| match output {
        Some(Ok(output)) => Ok(output),
        Some(Err(err)) => Err(OrchestrateError(format!("Failed to collect process {}: {}", pid, err))),
        None => Err(OrchestrateError(format!("Lost track of process {}", pid))),
    };
    Ok((finished(first_output, first_pid)?, finished(second_output, second_pid)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    fn timing(timeout_ms: u64) -> Timing {
        Timing { startup_delay: Duration::from_millis(10), timeout: Duration::from_millis(timeout_ms) }
    }

    #[test]
    fn collects_both_outputs() {
        let (first, second) =
            run_pair(&mut sh("echo one; echo err >&2; exit 3"), &mut sh("printf two"), timing(10_000)).unwrap();
        assert_eq!(first.status, Status::Code(3));
        assert_eq!(first.stdout, b"one\n");
        assert_eq!(first.stderr, b"err\n");
        assert_eq!(second.status, Status::Code(0));
        assert!(second.status.success());
        assert_eq!(second.stdout, b"two");
    }

    #[test]
    fn deadline_kills_both() {
        let start = Instant::now();
        let (first, second) = run_pair(&mut sh("sleep 30"), &mut sh("echo partial; sleep 30"), timing(500)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(first.is_timeout());
        assert!(second.is_timeout());
        assert!(second.stdout.is_empty());
    }

    #[test]
    fn deadline_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let first = format!("(sleep 2; touch {}) & sleep 30", marker.display());
        let (first, _) = run_pair(&mut sh(&first), &mut sh("sleep 30"), timing(300)).unwrap();
        assert!(first.is_timeout());
        thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists());
    }

    #[test]
    fn only_unfinished_groups_killed() {
        let outputs: [Option<io::Result<ProcessOutput>>; 2] = [Some(Ok(ProcessOutput::timed_out())), None];
        assert_eq!(live_groups(&outputs, [100, 200]), vec![200]);
        assert_eq!(live_groups(&[None, None], [100, 200]), vec![100, 200]);
    }

    #[test]
    fn startup_delay_past_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("debugger-started");
        let late = Timing { startup_delay: Duration::from_millis(300), timeout: Duration::from_millis(200) };
        let (first, second) =
            run_pair(&mut sh("sleep 30"), &mut sh(&format!("touch {}", marker.display())), late).unwrap();
        assert!(first.is_timeout());
        assert!(second.is_timeout());
        assert!(!marker.exists());
    }

    #[test]
    fn signalled_child() {
        let (first, _) = run_pair(&mut sh("kill -9 $$"), &mut sh("true"), timing(10_000)).unwrap();
        assert_eq!(first.status, Status::Signal(9));
    }

    #[test]
    fn report_format() {
        let output = ProcessOutput { status: Status::Code(1), stdout: b"out".to_vec(), stderr: b"err".to_vec() };
        assert_eq!(
            output.report(),
            "[return code: 1]\n\n---------- stderr ----------\nerr\n\n---------- stdout ----------\nout"
        );
        assert!(ProcessOutput::timed_out().report().starts_with("[return code: timeout]"));
    }
}
