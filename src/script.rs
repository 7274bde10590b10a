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

//! Renders a fault into a debugger command file: connect to the
//! simulator's debug stub, break on the chosen invocation, flip bits in
//! one register and let the program run to completion.

use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::registers::RegisterClass;
use crate::selector::FaultSpec;

/// Carry, parity, zero and sign.
pub const FLAGS_MASK: u32 = 0xC5;

#[derive(Debug)]
pub struct ScriptError(String);

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Error for ScriptError {}

fn write_corruption<W: Write>(out: &mut W, register: &str, mask: u8) -> std::io::Result<()> {
    match RegisterClass::of(register) {
        RegisterClass::Vector128 => {
            writeln!(out, "  p ${}.uint128", register)?;
            writeln!(out, "  set ${}.v2_int64[0] = ${}.v2_int64[0] ^ {}", register, register, mask)?;
            writeln!(out, "  p ${}.uint128", register)?;
        }
        RegisterClass::Vector256 => {
            writeln!(out, "  p ${}.v2_int128", register)?;
            writeln!(out, "  set ${}.v4_int64[0] = ${}.v4_int64[0] ^ {}", register, register, mask)?;
            writeln!(out, "  p ${}.v2_int128", register)?;
        }
        RegisterClass::Flags => {
            writeln!(out, "  p $eflags")?;
            writeln!(out, "  set $eflags = $eflags ^ {:#X}", FLAGS_MASK)?;
            writeln!(out, "  p $eflags")?;
        }
        RegisterClass::General => {
            writeln!(out, "  p ${}", register)?;
            writeln!(out, "  set ${} = (long long) ${} ^ {}", register, register, mask)?;
            writeln!(out, "  p ${}", register)?;
        }
    }
    Ok(())
}

pub fn render<W: Write>(out: &mut W, spec: &FaultSpec, debug_port: u16) -> std::io::Result<()> {
    writeln!(out, "target remote :{}", debug_port)?;
    writeln!(out, "tb *{:#x}", spec.inject_at)?;
    writeln!(out, "ignore 1 {}", spec.invocation.saturating_sub(1))?;
    writeln!(out, "commands 1")?;
    write_corruption(out, &spec.register, spec.mask)?;
    writeln!(out, "  continue")?;
    writeln!(out, "end")?;
    writeln!(out, "continue")?;
    writeln!(out, "p \"Going to detach...\"")?;
    writeln!(out, "detach")?;
    Ok(())
}

pub fn render_to_string(spec: &FaultSpec, debug_port: u16) -> String {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail
    let _ = render(&mut buf, spec, debug_port);
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn write_script(path: &Path, spec: &FaultSpec, debug_port: u16) -> Result<(), ScriptError> {
    let file = File::create(path)
        .map_err(|err| ScriptError(format!("Unable to create debugger script {}: {}", path.display(), err)))?;
    let mut out = BufWriter::new(file);
    render(&mut out, spec, debug_port)
        .and_then(|()| out.flush())
        .map_err(|err| ScriptError(format!("Unable to write debugger script {}: {}", path.display(), err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(register: &str, invocation: u64) -> FaultSpec {
        FaultSpec { address: 0x100, inject_at: 0x104, invocation, register: register.to_string(), mask: 0x21 }
    }

    #[test]
    fn general_register_script() {
        let script = render_to_string(&spec("rax", 2), 10000);
        assert_eq!(
            script,
            "target remote :10000\n\
             tb *0x104\n\
             ignore 1 1\n\
             commands 1\n  \
             p $rax\n  \
             set $rax = (long long) $rax ^ 33\n  \
             p $rax\n  \
             continue\n\
             end\n\
             continue\n\
             p \"Going to detach...\"\n\
             detach\n"
        );
    }

    #[test]
    fn breaks_on_successor_not_site() {
        let script = render_to_string(&spec("rbx", 1), 4000);
        assert!(script.contains("tb *0x104\n"));
        assert!(!script.contains("0x100"));
        assert!(script.contains("ignore 1 0\n"));
    }

    #[test]
    fn vector_registers_corrupt_low_quadword() {
        let xmm = render_to_string(&spec("xmm3", 1), 1);
        assert!(xmm.contains("  set $xmm3.v2_int64[0] = $xmm3.v2_int64[0] ^ 33\n"));
        assert!(xmm.contains("  p $xmm3.uint128\n"));

        let ymm = render_to_string(&spec("ymm7", 1), 1);
        assert!(ymm.contains("  set $ymm7.v4_int64[0] = $ymm7.v4_int64[0] ^ 33\n"));
        assert!(ymm.contains("  p $ymm7.v2_int128\n"));
    }

    #[test]
    fn flags_ignore_random_mask() {
        let script = render_to_string(&spec("rflags", 5), 1);
        assert!(script.contains("  set $eflags = $eflags ^ 0xC5\n"));
        assert!(!script.contains("^ 33"));
    }

    #[test]
    fn one_corruption_per_script() {
        for reg in &["rax", "xmm0", "ymm0", "rflags"] {
            let script = render_to_string(&spec(reg, 3), 1);
            assert_eq!(script.matches("  set $").count(), 1, "{}", reg);
        }
    }

    #[test]
    fn rendering_is_idempotent() {
        let s = spec("r12", 17);
        assert_eq!(render_to_string(&s, 10000), render_to_string(&s, 10000));
    }
}
