//! Monitor self-hardening
//!
//! The monitor creates kernel-visible objects after startup (the
//! discharge signal, the protective sub-group bookkeeping) without
//! explicit access descriptors. Hardening adjusts the process's default
//! creation template — the umask — and hands the runtime directory to
//! the administrators group, so those objects stay manageable by
//! privileged tooling even when the monitor runs under a restricted
//! identity. There is no degraded mode: if any step fails the monitor
//! cannot guarantee its own cleanup objects remain reachable.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::info;
use nix::sys::stat::{umask, Mode};
use nix::unistd::Group;

use crate::errors::{PrisonError, Result};

// Group read/write/execute plus setgid, so the admin group propagates
// to objects created underneath.
const RUNTIME_DIR_MODE: u32 = 0o2770;

/// Adjust the process's own security posture. Idempotent; must run
/// before any other kernel object is created.
pub fn harden_self(runtime_dir: &Path, admin_group: &str) -> Result<()> {
    let previous = umask(Mode::empty());
    let opened = Mode::from_bits_truncate(previous.bits() & !0o070);
    umask(opened);

    fs::create_dir_all(runtime_dir).map_err(|e| PrisonError::SecurityAdjustFailed {
        context: format!("cannot create runtime dir {}", runtime_dir.display()),
        source: e,
    })?;

    let group = Group::from_name(admin_group)
        .map_err(|e| PrisonError::SecurityAdjustFailed {
            context: format!("cannot resolve admin group {}", admin_group),
            source: io::Error::from_raw_os_error(e as i32),
        })?
        .ok_or_else(|| PrisonError::SecurityAdjustFailed {
            context: format!("admin group {} not found", admin_group),
            source: io::Error::from(io::ErrorKind::NotFound),
        })?;

    std::os::unix::fs::chown(runtime_dir, None, Some(group.gid.as_raw())).map_err(|e| {
        PrisonError::SecurityAdjustFailed {
            context: format!(
                "cannot grant {} to group {}",
                runtime_dir.display(),
                admin_group
            ),
            source: e,
        }
    })?;

    fs::set_permissions(runtime_dir, fs::Permissions::from_mode(RUNTIME_DIR_MODE)).map_err(
        |e| PrisonError::SecurityAdjustFailed {
            context: format!("cannot set mode on {}", runtime_dir.display()),
            source: e,
        },
    )?;

    info!(
        "Hardened monitor: runtime dir {} granted to group {}",
        runtime_dir.display(),
        admin_group
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::unistd::getegid;
    use tempfile::tempdir;

    struct UmaskGuard(Mode);

    impl UmaskGuard {
        fn save() -> Self {
            let current = umask(Mode::empty());
            umask(current);
            Self(current)
        }
    }

    impl Drop for UmaskGuard {
        fn drop(&mut self) {
            umask(self.0);
        }
    }

    fn own_group_name() -> String {
        Group::from_gid(getegid()).unwrap().unwrap().name
    }

    #[test]
    fn harden_self_prepares_runtime_dir() {
        let _guard = serial_guard();
        let _umask = UmaskGuard::save();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("prison");

        harden_self(&dir, &own_group_name()).unwrap();

        assert!(dir.is_dir());
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, RUNTIME_DIR_MODE);
    }

    #[test]
    fn harden_self_clears_group_umask_bits() {
        let _guard = serial_guard();
        let _umask = UmaskGuard::save();
        let tmp = tempdir().unwrap();

        umask(Mode::from_bits_truncate(0o077));
        harden_self(&tmp.path().join("p"), &own_group_name()).unwrap();

        let effective = umask(Mode::empty());
        umask(effective);
        assert_eq!(effective.bits() & 0o070, 0);
    }

    #[test]
    fn harden_self_is_idempotent() {
        let _guard = serial_guard();
        let _umask = UmaskGuard::save();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("prison");
        let group = own_group_name();

        harden_self(&dir, &group).unwrap();
        harden_self(&dir, &group).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn harden_self_fails_on_unknown_group() {
        let _guard = serial_guard();
        let _umask = UmaskGuard::save();
        let tmp = tempdir().unwrap();

        let err = harden_self(&tmp.path().join("p"), "no-such-prison-group").unwrap_err();
        assert!(matches!(err, PrisonError::SecurityAdjustFailed { .. }));
    }
}
