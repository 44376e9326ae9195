//! Membership enumeration for isolation groups
//!
//! Reads the live member pid list of a group through a reusable buffer
//! sized for an assumed-maximum member count. If the kernel reports more
//! members than the buffer holds, the capacity is doubled and the query
//! retried, up to a hard cap.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::debug;

use crate::errors::{PrisonError, Result};

/// Initial enumeration capacity, in member entries.
pub const INITIAL_CAPACITY: usize = 16384;

/// Hard cap on enumeration capacity. Reaching it yields
/// `BufferExhausted` rather than growing without bound.
pub const MAX_CAPACITY: usize = 1 << 20;

// Sizing heuristic: a decimal pid plus separator fits in 8 bytes.
const BYTES_PER_ENTRY: usize = 8;

enum ReadOutcome {
    /// Full member list read; holds the number of bytes filled.
    Complete(usize),
    /// Buffer filled before the list ended.
    Truncated,
}

/// Reusable member id buffer.
///
/// Capacity never shrinks: it stays sized for the historical high-water
/// mark of the group, so steady-state ticks do not reallocate.
#[derive(Debug)]
pub struct MemberBuffer {
    buf: Vec<u8>,
    capacity: usize,
    max_capacity: usize,
}

impl MemberBuffer {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_CAPACITY, MAX_CAPACITY)
    }

    fn with_limits(capacity: usize, max_capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            max_capacity,
        }
    }

    /// Current capacity in member entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enumerate the member pids listed in `procs_file`.
    ///
    /// Returns the complete, deduplicated id set. Fails with
    /// `QueryFailed` if the underlying read fails for any reason other
    /// than an undersized buffer, and with `BufferExhausted` once the
    /// growth cap is reached.
    pub fn enumerate(&mut self, procs_file: &Path) -> Result<Vec<u32>> {
        loop {
            let byte_cap = self.capacity * BYTES_PER_ENTRY;
            if self.buf.len() < byte_cap {
                self.buf.resize(byte_cap, 0);
            }

            match self.fill_from(procs_file, byte_cap)? {
                ReadOutcome::Complete(filled) => {
                    return parse_ids(&self.buf[..filled], procs_file);
                }
                ReadOutcome::Truncated => {
                    if self.capacity >= self.max_capacity {
                        return Err(PrisonError::BufferExhausted {
                            capacity: self.capacity,
                        });
                    }
                    debug!(
                        "member id list larger than {} entries, doubling",
                        self.capacity
                    );
                    self.capacity = (self.capacity * 2).min(self.max_capacity);
                }
            }
        }
    }

    fn fill_from(&mut self, procs_file: &Path, byte_cap: usize) -> Result<ReadOutcome> {
        let mut file = File::open(procs_file).map_err(|e| PrisonError::QueryFailed {
            context: format!("cannot open member list {}", procs_file.display()),
            source: e,
        })?;

        let mut filled = 0;
        while filled < byte_cap {
            let n = file
                .read(&mut self.buf[filled..byte_cap])
                .map_err(|e| PrisonError::QueryFailed {
                    context: "member list read".to_string(),
                    source: e,
                })?;
            if n == 0 {
                return Ok(ReadOutcome::Complete(filled));
            }
            filled += n;
        }

        // Buffer is full; probe for one more byte to distinguish an
        // exact fit from truncation.
        let mut probe = [0u8; 1];
        let n = file.read(&mut probe).map_err(|e| PrisonError::QueryFailed {
            context: "member list read".to_string(),
            source: e,
        })?;
        if n == 0 {
            Ok(ReadOutcome::Complete(filled))
        } else {
            Ok(ReadOutcome::Truncated)
        }
    }
}

impl Default for MemberBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_ids(bytes: &[u8], procs_file: &Path) -> Result<Vec<u32>> {
    let text = std::str::from_utf8(bytes).map_err(|_| PrisonError::QueryFailed {
        context: format!("member list {} is not valid UTF-8", procs_file.display()),
        source: io::Error::from(io::ErrorKind::InvalidData),
    })?;

    let mut ids = Vec::new();
    for token in text.split_ascii_whitespace() {
        let id: u32 = token.parse().map_err(|_| PrisonError::QueryFailed {
            context: format!("unparsable member id {:?}", token),
            source: io::Error::from(io::ErrorKind::InvalidData),
        })?;
        ids.push(id);
    }

    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}
