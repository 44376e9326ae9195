//! Per-process memory sampling via /proc
//!
//! For each member pid the sampler reads resident, swapped, and
//! kernel-stack usage from `/proc/<pid>/status`. The quota comparison
//! uses the aggregate of all three counters over all members.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::errors::{PrisonError, Result};
use crate::utils;

/// Memory counters for one member process, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    /// Resident set size (the working set)
    pub resident_bytes: u64,
    /// Swapped-out anonymous memory
    pub swap_bytes: u64,
    /// Kernel stack usage
    pub kernel_stack_bytes: u64,
}

impl MemoryCounters {
    /// Total charged against the group quota
    pub fn total(&self) -> u64 {
        self.resident_bytes + self.swap_bytes + self.kernel_stack_bytes
    }
}

/// One poll tick's sample for a single member
#[derive(Debug, Clone, Copy)]
pub struct MemberSample {
    pub pid: u32,
    pub counters: MemoryCounters,
}

/// Memory sampler reading from a procfs root
#[derive(Debug)]
pub struct MemorySampler {
    proc_root: PathBuf,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            proc_root: utils::proc_root(),
        }
    }

    /// Sample memory counters for every pid in `ids`.
    ///
    /// A pid that cannot be read is fatal: membership may have changed
    /// between enumeration and sampling, and the contract keeps that
    /// race an unrecoverable monitor failure rather than skipping the
    /// vanished member.
    pub fn sample(&self, ids: &[u32]) -> Result<Vec<MemberSample>> {
        let mut samples = Vec::with_capacity(ids.len());
        for &pid in ids {
            samples.push(MemberSample {
                pid,
                counters: self.sample_one(pid)?,
            });
        }
        Ok(samples)
    }

    fn sample_one(&self, pid: u32) -> Result<MemoryCounters> {
        let status_path = self.proc_root.join(pid.to_string()).join("status");
        let content = fs::read_to_string(&status_path).map_err(|e| PrisonError::SampleFailed {
            pid,
            context: status_path.display().to_string(),
            source: e,
        })?;

        let mut counters = MemoryCounters::default();
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                counters.resident_bytes = parse_kib(rest, pid)?;
            } else if let Some(rest) = line.strip_prefix("VmSwap:") {
                counters.swap_bytes = parse_kib(rest, pid)?;
            } else if let Some(rest) = line.strip_prefix("KernelStack:") {
                counters.kernel_stack_bytes = parse_kib(rest, pid)?;
            }
        }
        Ok(counters)
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum the quota-relevant counters over all samples
pub fn aggregate(samples: &[MemberSample]) -> u64 {
    samples.iter().map(|s| s.counters.total()).sum()
}

// Status lines read "VmRSS:      1234 kB".
fn parse_kib(rest: &str, pid: u32) -> Result<u64> {
    let value = rest
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .map_err(|_| PrisonError::SampleFailed {
            pid,
            context: format!("unparsable status line value {:?}", rest.trim()),
            source: io::Error::from(io::ErrorKind::InvalidData),
        })?;
    Ok(value * 1024)
}
