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

//! Scans a per-thread dynamic instruction trace and builds the table of
//! instructions inside transactional regions that can have a fault
//! injected into their output register.
//!
//! A trace line looks like
//!
//! ```text
//! TID1: INS 0x0000000000401a2c BASE add rax, rbx | rax = 0x2a, rflags = 0x202
//! TID1: INS 0x0000000000401a30 SSE  addps xmm1, xmm2
//! ```

use regex::Regex;

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use crate::registers::{self, RegisterSet};

const LINE_MARKER: &str = "INS";

const RTM_CATEGORY: &str = "RTM";
const XBEGIN: &str = "xbegin";
const XEND: &str = "xtest";

const VECTOR128_CATEGORY: &str = "SSE";
const VECTOR256_CATEGORY: &str = "AVX";

/// Separates the disassembly from the register-assignment annotation.
pub const REGISTER_SEPARATOR: char = '|';

// Corrupting these changes control flow rather than data.
const IGNORED_MNEMONICS: [&str; 5] = ["pop", "push", "ret", "call", "cmp"];

#[derive(Debug)]
pub enum TraceError {
    Io(io::Error),
    Malformed { line: usize, reason: String },
    TooFewSites(usize),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TraceError::*;
        match self {
            Io(err) => write!(f, "Unable to read dynamic trace: {}", err),
            Malformed { line, reason } => write!(f, "Bad dynamic trace line {}: {}", line, reason),
            TooFewSites(n) => {
                write!(f, "Dynamic trace yields {} injectable instruction(s), at least 2 are required", n)
            }
        }
    }
}

impl Error for TraceError {}

impl From<io::Error> for TraceError {
    fn from(err: io::Error) -> Self {
        TraceError::Io(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstructionSite {
    pub invocations: u64,
    pub register: String,
    /// Address of the instruction executed right after this one. The
    /// breakpoint goes here so that the output register already holds the
    /// computed value.
    pub successor: Option<u64>,
}

/// Injectable instructions keyed by address. Ordered so that a seeded
/// selection is reproducible.
#[derive(Clone, Debug, Default)]
pub struct SiteTable {
    sites: BTreeMap<u64, InstructionSite>,
    threads_examined: u32,
}

impl SiteTable {
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn get(&self, address: u64) -> Option<&InstructionSite> {
        self.sites.get(&address)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, u64, InstructionSite> {
        self.sites.iter()
    }

    pub fn threads_examined(&self) -> u32 {
        self.threads_examined
    }
}

#[derive(Debug)]
struct TraceLine<'a> {
    thread: u32,
    address: u64,
    category: &'a str,
    mnemonic: &'a str,
    operand: Option<&'a str>,
    assignment: Option<&'a str>,
}

fn parse_address(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

fn parse_line(line: &str, number: usize) -> Result<TraceLine<'_>, TraceError> {
    lazy_static! {
        static ref THREAD: Regex = Regex::new(r"^TID(\d+):?$").unwrap();
    }

    let bad = |reason: String| TraceError::Malformed { line: number, reason };

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return Err(bad(format!("expected at least 5 fields, found {}", tokens.len())));
    }
    if tokens[1] != LINE_MARKER {
        return Err(bad(format!("expected line type {}, found {}", LINE_MARKER, tokens[1])));
    }

    let thread = THREAD
        .captures(tokens[0])
        .and_then(|caps| caps[1].parse().ok())
        .ok_or_else(|| bad(format!("bad thread id {}", tokens[0])))?;
    let address = parse_address(tokens[2]).ok_or_else(|| bad(format!("bad address {}", tokens[2])))?;

    let assignment = line.splitn(2, REGISTER_SEPARATOR).nth(1);
    let operand = tokens.get(5).map(|op| op.split(',').next().unwrap_or(op));

    Ok(TraceLine { thread, address, category: tokens[3], mnemonic: tokens[4], operand, assignment })
}

pub struct TraceAnalyzer<'r> {
    registers: &'r RegisterSet,
    table: SiteTable,
}

impl<'r> TraceAnalyzer<'r> {
    pub fn new(registers: &'r RegisterSet) -> Self {
        TraceAnalyzer { registers, table: SiteTable::default() }
    }

    fn output_register(&self, ins: &TraceLine) -> Option<String> {
        if let Some(assignment) = ins.assignment {
            let first = assignment.split(',').next()?;
            let name = first.split('=').next()?.trim();
            if self.registers.accepts_general(name) {
                Some(name.to_string())
            } else {
                None
            }
        } else if ins.category.contains(VECTOR128_CATEGORY) {
            ins.operand.filter(|op| registers::is_vector128(op)).map(str::to_string)
        } else if ins.category.contains(VECTOR256_CATEGORY) {
            ins.operand.filter(|op| registers::is_vector256(op)).map(str::to_string)
        } else {
            None
        }
    }

    /// Scan the trace for one thread, adding to the site table. Returns
    /// whether any site was added or had its invocation count bumped.
    pub fn scan_thread<R: BufRead>(&mut self, reader: R, thread: u32) -> Result<bool, TraceError> {
        let mut modified = false;
        let mut in_rtm = false;
        let mut pending: Option<u64> = None;

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let ins = parse_line(&line, i + 1)?;
            if ins.thread != thread {
                continue;
            }

            if let Some(previous) = pending.take() {
                if let Some(site) = self.table.sites.get_mut(&previous) {
                    site.successor = Some(ins.address)
                }
            }

            if ins.category == RTM_CATEGORY {
                match ins.mnemonic {
                    XBEGIN => in_rtm = true,
                    XEND => in_rtm = false,
                    _ => (),
                }
                continue;
            }

            if !in_rtm || IGNORED_MNEMONICS.contains(&ins.mnemonic) {
                continue;
            }

            let register = match self.output_register(&ins) {
                Some(register) => register,
                None => continue,
            };

            self.table
                .sites
                .entry(ins.address)
                .and_modify(|site| site.invocations += 1)
                .or_insert(InstructionSite { invocations: 1, register, successor: None });

            modified = true;
            pending = Some(ins.address);
        }

        Ok(modified)
    }

    /// Examine threads 1, 2, ... until a thread contributes nothing. Thread
    /// 0 only does setup work and is skipped. `open` is called once per
    /// thread to rewind the trace.
    pub fn analyze<F, R>(mut self, mut open: F) -> Result<SiteTable, TraceError>
    where
        F: FnMut() -> io::Result<R>,
        R: BufRead,
    {
        let mut thread = 1;
        while self.scan_thread(open()?, thread)? {
            thread += 1;
        }
        self.table.threads_examined = thread - 1;

        if self.table.len() < 2 {
            return Err(TraceError::TooFewSites(self.table.len()));
        }
        Ok(self.table)
    }
}

pub fn analyze_file(path: &Path, registers: &RegisterSet) -> Result<SiteTable, TraceError> {
    TraceAnalyzer::new(registers).analyze(|| File::open(path).map(BufReader::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn analyze_str(trace: &str, registers: &RegisterSet) -> Result<SiteTable, TraceError> {
        TraceAnalyzer::new(registers).analyze(|| Ok(Cursor::new(trace.as_bytes())))
    }

    const TWO_SITES: &str = "\
TID0: INS 0x0000000000000010 BASE mov rax, rbx | rax = 0x1
TID1: INS 0x00000000000000f0 RTM xbegin 0x120
TID1: INS 0x0000000000000100 BASE add rax, rbx | rax = 0x2, rflags = 0x202
TID1: INS 0x0000000000000104 BASE nop
TID1: INS 0x0000000000000100 BASE add rax, rbx | rax = 0x3, rflags = 0x202
TID1: INS 0x0000000000000104 BASE nop
TID1: INS 0x0000000000000100 BASE add rax, rbx | rax = 0x4, rflags = 0x202
TID1: INS 0x0000000000000200 SSE addps xmm1, xmm2
TID1: INS 0x0000000000000204 RTM xtest
TID1: INS 0x0000000000000300 BASE add rcx, rdx | rcx = 0x9
";

    #[test]
    fn two_sites_in_region() {
        let table = analyze_str(TWO_SITES, &RegisterSet::default()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.threads_examined(), 1);

        let gp = table.get(0x100).unwrap();
        assert_eq!(gp.invocations, 3);
        assert_eq!(gp.register, "rax");
        assert_eq!(gp.successor, Some(0x200));

        let xmm = table.get(0x200).unwrap();
        assert_eq!(xmm.invocations, 1);
        assert_eq!(xmm.register, "xmm1");
        assert_eq!(xmm.successor, Some(0x204));

        // outside the region
        assert!(table.get(0x300).is_none());
        // thread 0 is never examined
        assert!(table.get(0x10).is_none());
    }

    #[test]
    fn ignored_and_unsupported_instructions() {
        let trace = "\
TID1: INS 0x10 RTM xbegin
TID1: INS 0x20 BASE push rbp | rsp = 0x7ff0
TID1: INS 0x24 BASE cmp rax, rbx | rflags = 0x246
TID1: INS 0x28 BASE sub rsp, 0x8 | rsp = 0x7fe8
TID1: INS 0x2c SSE movaps xmmword ptr [rax], xmm0
TID1: INS 0x30 AVX vmovaps ymmword ptr [rax], ymm0
TID1: INS 0x34 AVX vaddps ymm3, ymm1, ymm2
TID1: INS 0x38 BASE xor r9, r9 | r9 = 0x0
TID1: INS 0x3c RTM xtest
";
        let table = analyze_str(trace, &RegisterSet::default()).unwrap();
        let addresses: Vec<u64> = table.iter().map(|(a, _)| *a).collect();
        assert_eq!(addresses, vec![0x34, 0x38]);
        assert_eq!(table.get(0x34).unwrap().register, "ymm3");
        assert_eq!(table.get(0x38).unwrap().successor, Some(0x3c));
    }

    #[test]
    fn flags_register_opt_in() {
        let trace = "\
TID1: INS 0x10 RTM xbegin
TID1: INS 0x20 BASE sahf | rflags = 0x246
TID1: INS 0x24 BASE inc rax | rax = 0x1
TID1: INS 0x28 RTM xtest
";
        assert!(matches!(analyze_str(trace, &RegisterSet::default()), Err(TraceError::TooFewSites(1))));
        let table = analyze_str(trace, &RegisterSet::new(true)).unwrap();
        assert_eq!(table.get(0x20).unwrap().register, "rflags");
    }

    #[test]
    fn sites_shared_between_threads() {
        let trace = "\
TID1: INS 0x10 RTM xbegin
TID2: INS 0x10 RTM xbegin
TID1: INS 0x20 BASE inc rax | rax = 0x1
TID2: INS 0x20 BASE inc rax | rax = 0x5
TID2: INS 0x24 BASE inc rbx | rbx = 0x1
TID1: INS 0x28 RTM xtest
TID2: INS 0x2c RTM xtest
";
        let table = analyze_str(trace, &RegisterSet::default()).unwrap();
        assert_eq!(table.threads_examined(), 2);
        assert_eq!(table.get(0x20).unwrap().invocations, 2);
        assert_eq!(table.get(0x24).unwrap().invocations, 1);
        // the last writer wins
        assert_eq!(table.get(0x20).unwrap().successor, Some(0x24));
    }

    #[test]
    fn count_stops_after_region_ends() {
        let trace = "\
TID1: INS 0x10 RTM xbegin
TID1: INS 0x20 BASE inc rax | rax = 0x1
TID1: INS 0x24 BASE inc rbx | rbx = 0x1
TID1: INS 0x28 RTM xtest
TID1: INS 0x20 BASE inc rax | rax = 0x2
TID1: INS 0x20 BASE inc rax | rax = 0x3
";
        let table = analyze_str(trace, &RegisterSet::default()).unwrap();
        assert_eq!(table.get(0x20).unwrap().invocations, 1);
    }

    #[test]
    fn last_site_has_no_successor() {
        let trace = "\
TID1: INS 0x10 RTM xbegin
TID1: INS 0x20 BASE inc rax | rax = 0x1
TID1: INS 0x24 BASE inc rbx | rbx = 0x1
";
        let table = analyze_str(trace, &RegisterSet::default()).unwrap();
        assert_eq!(table.get(0x20).unwrap().successor, Some(0x24));
        assert_eq!(table.get(0x24).unwrap().successor, None);
    }

    #[test]
    fn malformed_lines() {
        let short = "TID1: INS 0x10 BASE\n";
        match analyze_str(short, &RegisterSet::default()) {
            Err(TraceError::Malformed { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected {:?}", other),
        }
        let marker = "\nTID1: XYZ 0x10 BASE nop\n";
        match analyze_str(marker, &RegisterSet::default()) {
            Err(TraceError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_trace_is_fatal() {
        assert!(matches!(analyze_str("", &RegisterSet::default()), Err(TraceError::TooFewSites(0))));
    }
}
