//! Isolation group handles backed by cgroup v2
//!
//! An isolation group is a named cgroup directory: membership is the
//! kernel's `cgroup.procs` list and forced termination is a write to
//! `cgroup.kill`, which kills every member atomically. The supervised
//! group is created by the orchestrator and merely opened here; the
//! protective sub-group is owned by the monitor and flagged so its
//! members die when the handle is dropped.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::errors::{PrisonError, Result};
use crate::utils;

const PROCS_FILE: &str = "cgroup.procs";
const KILL_FILE: &str = "cgroup.kill";

/// Handle to one isolation group
#[derive(Debug)]
pub struct IsolationGroup {
    name: String,
    path: PathBuf,
    kill_on_close: bool,
}

impl IsolationGroup {
    /// Open the group `name`, creating it if the orchestrator has not
    /// done so yet. "Already exists" is a normal condition, not an error.
    pub fn open_or_create(name: &str) -> Result<Self> {
        let path = utils::cgroup_root().join(name);

        if path.is_dir() {
            info!("Opened existing isolation group: {}", name);
        } else {
            fs::create_dir_all(&path).map_err(|e| PrisonError::Group {
                context: format!("cannot create isolation group {}", path.display()),
                source: e,
            })?;
            info!("Created new isolation group: {}", name);
        }

        ensure_member_files(&path)?;

        Ok(Self {
            name: name.to_string(),
            path,
            kill_on_close: false,
        })
    }

    /// Create the monitor-owned protective sub-group.
    ///
    /// A pre-existing group of this name means a double-started monitor
    /// or stale state, which is a configuration error rather than a
    /// recoverable race. The fate-sharing flag is set at creation: every
    /// member dies when this handle is dropped.
    pub fn create_protective(name: &str) -> Result<Self> {
        let root = utils::cgroup_root();
        fs::create_dir_all(&root).map_err(|e| PrisonError::Group {
            context: format!("cannot create group root {}", root.display()),
            source: e,
        })?;

        let path = root.join(name);
        if path.exists() {
            return Err(PrisonError::GroupExists(name.to_string()));
        }

        fs::create_dir(&path).map_err(|e| PrisonError::Group {
            context: format!("cannot create protective group {}", path.display()),
            source: e,
        })?;
        ensure_member_files(&path)?;
        info!("Created protective sub-group: {}", name);

        Ok(Self {
            name: name.to_string(),
            path,
            kill_on_close: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the live member pid list
    pub fn procs_file(&self) -> PathBuf {
        self.path.join(PROCS_FILE)
    }

    /// Attach a process to this group
    pub fn attach(&self, pid: u32) -> Result<()> {
        let procs = self.procs_file();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&procs)
            .map_err(|e| PrisonError::Group {
                context: format!("cannot open {}", procs.display()),
                source: e,
            })?;
        writeln!(file, "{}", pid).map_err(|e| PrisonError::Group {
            context: format!("cannot attach pid {}", pid),
            source: e,
        })?;
        Ok(())
    }

    /// Forcibly terminate every member of this group
    pub fn terminate(&self) -> Result<()> {
        let kill = self.path.join(KILL_FILE);
        fs::write(&kill, "1").map_err(|e| PrisonError::Group {
            context: format!("cannot terminate group {}", self.name),
            source: e,
        })?;
        Ok(())
    }

    // Move this process back to the hierarchy root. The monitor lives in
    // its protective sub-group; it has to leave before the kill.
    fn detach_self(&self) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(parent.join(PROCS_FILE))?;
        writeln!(file, "{}", std::process::id())
    }

}

// Fake roots in tests do not provide kernel interface files; a mounted
// cgroupfs always does, so creation is skipped there.
fn ensure_member_files(path: &Path) -> Result<()> {
    for name in [PROCS_FILE, KILL_FILE] {
        let file_path = path.join(name);
        if !file_path.exists() {
            fs::write(&file_path, "").map_err(|e| PrisonError::Group {
                context: format!("cannot create {}", file_path.display()),
                source: e,
            })?;
        }
    }
    Ok(())
}

impl Drop for IsolationGroup {
    fn drop(&mut self) {
        if !self.kill_on_close {
            return;
        }
        if self.detach_self().is_err() {
            warn!("could not leave protective group {}", self.name);
        }
        if let Err(e) = self.terminate() {
            warn!("protective group {} teardown: {}", self.name, e);
        }
        let _ = fs::remove_dir(&self.path);
    }
}
