//! Utility functions shared by the guard and the delegate

use crate::errors::{PrisonError, Result};
#[cfg(test)]
use std::cell::Cell;
use std::path::PathBuf;

/// Default cgroup v2 mount point backing isolation groups.
pub const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";

/// Default procfs mount point used for memory sampling.
pub const PROC_ROOT: &str = "/proc";

/// Default global runtime directory holding discharge signals.
pub const RUNTIME_DIR: &str = "/run/prison";

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    unsafe { libc::geteuid() == 0 }
}

/// Root of the cgroup hierarchy, overridable for tests
pub fn cgroup_root() -> PathBuf {
    std::env::var("PRISON_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_V2_ROOT))
}

/// Root of procfs, overridable for tests
pub fn proc_root() -> PathBuf {
    std::env::var("PRISON_PROC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(PROC_ROOT))
}

/// Runtime directory for discharge signals, overridable for tests
pub fn runtime_dir() -> PathBuf {
    std::env::var("PRISON_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(RUNTIME_DIR))
}

/// Administrators group that keeps access to monitor-created objects
pub fn admin_group() -> String {
    std::env::var("PRISON_ADMIN_GROUP").unwrap_or_else(|_| "root".to_string())
}

/// Parse a memory quota given in bytes; 0 disables enforcement
pub fn parse_quota_bytes(s: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| PrisonError::InvalidConfig(format!("Invalid memory quota: {}", s)))
}

#[cfg(test)]
pub fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}
