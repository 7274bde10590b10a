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

use rand::seq::SliceRandom;
use rand::Rng;

use std::fmt;

use crate::registers::RegisterClass;
use crate::trace::SiteTable;

/// Breaking on a late invocation makes the debugger crawl, so only the
/// first few hundred are considered.
pub const MAX_INVOCATION: u64 = 300;

/// One trial's fault: corrupt `register` by xoring in `mask` when the
/// instruction at `address` executes for the `invocation`th time. The
/// breakpoint itself goes on `inject_at`, the instruction after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultSpec {
    pub address: u64,
    pub inject_at: u64,
    pub invocation: u64,
    pub register: String,
    pub mask: u8,
}

impl FaultSpec {
    pub fn register_class(&self) -> RegisterClass {
        RegisterClass::of(&self.register)
    }
}

impl fmt::Display for FaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} (break at {:#x}) invocation {} register {} mask {:#04x}",
            self.address, self.inject_at, self.invocation, self.register, self.mask
        )
    }
}

/// Draw a random fault from the site table. Sites for which the trace
/// never showed a following instruction cannot be broken on and are
/// never chosen.
pub fn select_fault<R: Rng>(sites: &SiteTable, rng: &mut R) -> Option<FaultSpec> {
    let candidates: Vec<_> = sites.iter().filter(|(_, site)| site.successor.is_some()).collect();
    let (address, site) = candidates.choose(rng)?;

    let limit = site.invocations.min(MAX_INVOCATION).max(1);
    let invocation = rng.gen_range(1, limit + 1);
    let mask = rng.gen_range(1u16, 256) as u8;

    Some(FaultSpec { address: **address, inject_at: site.successor?, invocation, register: site.register.clone(), mask })
}
