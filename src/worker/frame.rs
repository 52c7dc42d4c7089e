//! Framing of the manager ↔ worker pipe protocol.
//!
//! Manager to child: length-prefixed frames, two per job (the job id, then
//! the JSON encoded argument list). Nothing follows the payload bytes.
//!
//! ```text
//! $32\n3f2a...e9$13\n["John",2.5]
//! ```
//!
//! A `stop` id frame asks the child to exit.
//!
//! Child to manager: one line per job, `done` or `error`. An idle child may
//! also print `wait` lines, which carry no meaning.

use std::io::{self, BufRead, Read};

/// Id frame that asks the child to exit cleanly.
pub const STOP: &str = "stop";

/// Encodes one frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.push(b'$');
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// A line written by the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Done,
    Error,
    Wait,
    /// Anything else is a protocol violation.
    Unknown(String),
}

impl WorkerReply {
    /// Parses one line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "" => None,
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "wait" => Some(Self::Wait),
            other => Some(Self::Unknown(other.to_string())),
        }
    }

    pub fn as_line(&self) -> &str {
        match self {
            Self::Done => "done\n",
            Self::Error => "error\n",
            Self::Wait => "wait\n",
            Self::Unknown(s) => s,
        }
    }
}

/// Reads frames on the child side.
pub struct FrameReader<R> {
    inner: R,
    header: String,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: String::with_capacity(32),
        }
    }

    /// Reads the next frame; `Ok(None)` on end of input.
    ///
    /// Blank lines before a header are skipped. A header that does not
    /// start with `$` is an `InvalidData` error.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let size = loop {
            self.header.clear();
            if self.inner.read_line(&mut self.header)? == 0 {
                return Ok(None);
            }
            let header = self.header.trim();
            if header.is_empty() {
                continue;
            }
            let size = header
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Bad protocol size : {}", header),
                    )
                })?;
            break size;
        };

        let mut payload = vec![0u8; size];
        self.inner.read_exact(&mut payload)?;
        Ok(Some(payload))
    }
}
