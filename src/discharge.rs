//! Discharge signal
//!
//! A named, globally visible, manually-reset boolean: the orchestrator
//! sets it to decommission a monitor cooperatively, the monitor polls it
//! non-blocking each tick. The signal is a marker file in the runtime
//! directory, so it outlives a crashed monitor and can be observed by a
//! replacement instance.

use std::fs;
use std::path::PathBuf;

use log::info;

use crate::errors::{PrisonError, Result};
use crate::utils;

/// Handle to the discharge signal of one isolation group
#[derive(Debug)]
pub struct DischargeSignal {
    name: String,
    path: PathBuf,
}

impl DischargeSignal {
    /// Derived global name for a group's discharge signal
    pub fn signal_name(group_name: &str) -> String {
        format!("discharge-{}", group_name)
    }

    /// Open the signal for `group_name`, creating the runtime directory
    /// if needed. The signal itself starts unset; an already-set signal
    /// stays set.
    pub fn open_or_create(group_name: &str) -> Result<Self> {
        let dir = utils::runtime_dir();
        fs::create_dir_all(&dir).map_err(|e| PrisonError::Signal {
            context: format!("cannot create runtime dir {}", dir.display()),
            source: e,
        })?;

        let name = Self::signal_name(group_name);
        let path = dir.join(&name);
        Ok(Self { name, path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking check; once set, stays set
    pub fn is_set(&self) -> bool {
        self.path.is_file()
    }

    /// Set the signal. Idempotent; the producer side of the protocol,
    /// exposed for orchestration tooling and tests.
    pub fn set(&self) -> Result<()> {
        fs::write(&self.path, "discharged\n").map_err(|e| PrisonError::Signal {
            context: format!("cannot set {}", self.name),
            source: e,
        })?;
        info!("Discharge signal set: {}", self.name);
        Ok(())
    }
}
