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

//! Register classes that a fault can be injected into, and the set of
//! register names the trace analyzer accepts as instruction outputs.

use std::fmt;

/// The register class decides how much of a register gets corrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterClass {
    General,
    Vector128,
    Vector256,
    Flags,
}

impl RegisterClass {
    pub fn of(name: &str) -> Self {
        use RegisterClass::*;
        if name.starts_with("xmm") {
            Vector128
        } else if name.starts_with("ymm") {
            Vector256
        } else if name.starts_with("rflags") {
            Flags
        } else {
            General
        }
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RegisterClass::*;
        write!(
            f,
            "{}",
            match self {
                General => "general",
                Vector128 => "vector-128",
                Vector256 => "vector-256",
                Flags => "flags",
            }
        )
    }
}

// rsp and rip are control-flow, never injected.
const GENERAL_REGS: [&str; 15] =
    ["rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15"];

const FLAGS_REG: &str = "rflags";

/// Whitelist of register names found in the trace's register-assignment
/// annotation that may be injected.
#[derive(Clone, Debug)]
pub struct RegisterSet {
    general: Vec<String>,
}

impl RegisterSet {
    pub fn new(inject_flags: bool) -> Self {
        let mut general: Vec<String> = GENERAL_REGS.iter().map(|r| r.to_string()).collect();
        if inject_flags {
            general.push(FLAGS_REG.to_string());
        }
        RegisterSet { general }
    }

    pub fn accepts_general(&self, name: &str) -> bool {
        self.general.iter().any(|r| r == name)
    }

    pub fn includes_flags(&self) -> bool {
        self.accepts_general(FLAGS_REG)
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        RegisterSet::new(false)
    }
}

/// A destination operand names a 128-bit vector register (and not an
/// `xmmword ptr` memory operand).
pub fn is_vector128(operand: &str) -> bool {
    operand.starts_with("xmm") && !operand.starts_with("xmmword")
}

pub fn is_vector256(operand: &str) -> bool {
    operand.starts_with("ymm") && !operand.starts_with("ymmword")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_only_when_requested() {
        assert!(!RegisterSet::new(false).accepts_general("rflags"));
        assert!(RegisterSet::new(true).accepts_general("rflags"));
        assert!(RegisterSet::new(true).includes_flags());
    }

    #[test]
    fn control_flow_registers_rejected() {
        let regs = RegisterSet::new(true);
        assert!(!regs.accepts_general("rsp"));
        assert!(!regs.accepts_general("rip"));
        assert!(regs.accepts_general("r15"));
    }

    #[test]
    fn vector_operands() {
        assert!(is_vector128("xmm3"));
        assert!(!is_vector128("xmmword"));
        assert!(!is_vector128("ymm3"));
        assert!(is_vector256("ymm12"));
        assert!(!is_vector256("ymmword"));
        assert_eq!(RegisterClass::of("ymm1"), RegisterClass::Vector256);
        assert_eq!(RegisterClass::of("rflags"), RegisterClass::Flags);
        assert_eq!(RegisterClass::of("r9"), RegisterClass::General);
    }
}
