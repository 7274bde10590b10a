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

//! What the program under test is expected to produce, and how a trial's
//! raw output is normalised before being compared against it.

use sha2::{Digest, Sha256};

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Lines of simulator banner preceding the program's own stdout.
pub const STDOUT_HEADER_LINES: usize = 3;
/// The simulator may prefix stderr with this single line.
pub const STDERR_HEADER_MARKER: &str = "TSX log collection started";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Comparison {
    Text { stream: Stream, sort: bool },
    /// Compare the SHA-256 digest of a file the program writes.
    Binary { artifact: PathBuf },
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::Text { stream, sort } => {
                let stream = match stream {
                    Stream::Stdout => "stdout",
                    Stream::Stderr => "stderr",
                };
                write!(f, "text ({}{})", stream, if *sort { ", sorted" } else { "" })
            }
            Comparison::Binary { artifact } => write!(f, "binary ({}, sha256)", artifact.display()),
        }
    }
}

#[derive(Debug)]
pub enum OutputError {
    Io(PathBuf, io::Error),
    Empty(PathBuf),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::Io(path, err) => write!(f, "Unable to read {}: {}", path.display(), err),
            OutputError::Empty(path) => write!(f, "Reference output {} is empty", path.display()),
        }
    }
}
impl Error for OutputError {}

/// Split keeping the line terminators.
fn lines_inclusive(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' {
            lines.push(&bytes[start..=i]);
            start = i + 1;
        }
    }
    if start < bytes.len() {
        lines.push(&bytes[start..]);
    }
    lines
}

fn join_lines(lines: Vec<&[u8]>, sort: bool) -> Vec<u8> {
    let mut lines = lines;
    if sort {
        lines.sort();
    }
    lines.concat()
}

pub fn digest(bytes: &[u8]) -> Vec<u8> {
    format!("{:x}", Sha256::digest(bytes)).into_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceOutput(Vec<u8>);

impl ReferenceOutput {
    pub fn load(path: &Path, comparison: &Comparison) -> Result<Self, OutputError> {
        let contents = fs::read(path).map_err(|err| OutputError::Io(path.to_path_buf(), err))?;
        // A digest is never empty, so an empty binary artifact is a valid reference.
        if contents.is_empty() && matches!(comparison, Comparison::Text { .. }) {
            return Err(OutputError::Empty(path.to_path_buf()));
        }
        Ok(ReferenceOutput::from_contents(&contents, comparison))
    }

    pub fn from_contents(contents: &[u8], comparison: &Comparison) -> Self {
        match comparison {
            Comparison::Binary { .. } => ReferenceOutput(digest(contents)),
            Comparison::Text { sort, .. } => ReferenceOutput(join_lines(lines_inclusive(contents), *sort)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The program's output after a clean run, normalised the same way as the
/// reference.
pub fn effective_output(comparison: &Comparison, stdout: &[u8], stderr: &[u8]) -> io::Result<Vec<u8>> {
    match comparison {
        Comparison::Binary { artifact } => Ok(digest(&fs::read(artifact)?)),
        Comparison::Text { stream: Stream::Stdout, sort } => {
            let lines = lines_inclusive(stdout).into_iter().skip(STDOUT_HEADER_LINES).collect();
            Ok(join_lines(lines, *sort))
        }
        Comparison::Text { stream: Stream::Stderr, sort } => {
            let mut lines = lines_inclusive(stderr);
            if lines.first().map_or(false, |l| String::from_utf8_lossy(l).contains(STDERR_HEADER_MARKER)) {
                lines.remove(0);
            }
            Ok(join_lines(lines, *sort))
        }
    }
}
