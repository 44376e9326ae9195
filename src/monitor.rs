//! Quota monitor controller
//!
//! Orchestrates enumeration and sampling each tick, compares the
//! aggregate against the configured quota, and forcibly terminates the
//! supervised group on breach. A set discharge signal ends the loop
//! cooperatively. All monitor-wide state lives in one owned value passed
//! through the state machine; there are no process-wide statics.

use std::time::Duration;

use log::{info, warn};

use crate::discharge::DischargeSignal;
use crate::errors::{PrisonError, Result};
use crate::group::IsolationGroup;
use crate::hardening;
use crate::members::MemberBuffer;
use crate::sampler::{aggregate, MemorySampler};
use crate::utils;

/// Default poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Suffix of the monitor's protective sub-group name
pub const GUARD_GROUP_SUFFIX: &str = "-guard";

/// Monitor configuration, immutable for the life of one run
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Name of the supervised isolation group
    pub group_name: String,
    /// Memory quota in bytes; 0 disables enforcement
    pub quota_bytes: u64,
    /// Poll interval
    pub interval: Duration,
    /// Run the security hardener at startup
    pub harden_acl: bool,
    /// Nest the monitor in a fate-sharing protective sub-group
    pub self_protect: bool,
    /// Administrators group granted access to monitor-created objects
    pub admin_group: String,
}

impl MonitorConfig {
    pub fn new(group_name: &str, quota_bytes: u64) -> Self {
        Self {
            group_name: group_name.to_string(),
            quota_bytes,
            interval: DEFAULT_POLL_INTERVAL,
            harden_acl: true,
            self_protect: true,
            admin_group: utils::admin_group(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_name.is_empty() {
            return Err(PrisonError::InvalidConfig(
                "Group name cannot be empty".to_string(),
            ));
        }
        if self.group_name.contains('/') {
            return Err(PrisonError::InvalidConfig(format!(
                "Group name cannot contain '/': {}",
                self.group_name
            )));
        }
        Ok(())
    }
}

/// Outcome of one poll tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Discharged,
}

/// Running quota monitor owning every guard-side handle.
///
/// Field order is the release order on discharge: supervised group
/// first, then the protective sub-group, then the signal.
#[derive(Debug)]
pub struct QuotaMonitor {
    config: MonitorConfig,
    supervised: IsolationGroup,
    protective: Option<IsolationGroup>,
    signal: DischargeSignal,
    members: MemberBuffer,
    sampler: MemorySampler,
    in_breach: bool,
    breach_episodes: u64,
}

impl QuotaMonitor {
    /// Run the Hardening and Initializing states: harden the monitor's
    /// own posture, then open the supervised group, create the
    /// protective sub-group, and open the discharge signal. Any failure
    /// here is fatal.
    pub fn start(config: MonitorConfig) -> Result<Self> {
        config.validate()?;

        if config.harden_acl {
            hardening::harden_self(&utils::runtime_dir(), &config.admin_group)?;
        }

        let supervised = IsolationGroup::open_or_create(&config.group_name)?;

        let protective = if config.self_protect {
            let name = format!("{}{}", config.group_name, GUARD_GROUP_SUFFIX);
            let group = IsolationGroup::create_protective(&name)?;
            group.attach(std::process::id())?;
            Some(group)
        } else {
            None
        };

        let signal = DischargeSignal::open_or_create(&config.group_name)?;

        info!(
            "Guarding group {} with quota {} bytes",
            config.group_name, config.quota_bytes
        );

        Ok(Self {
            config,
            supervised,
            protective,
            signal,
            members: MemberBuffer::new(),
            sampler: MemorySampler::new(),
            in_breach: false,
            breach_episodes: 0,
        })
    }

    /// One poll tick.
    ///
    /// The discharge signal is checked before any enumeration or
    /// comparison, so a discharge observed in the same tick as a breach
    /// deterministically wins and the group is never terminated on the
    /// way out.
    pub fn tick(&mut self) -> Result<Tick> {
        if self.signal.is_set() {
            info!("Guard is discharged. Shutting down.");
            return Ok(Tick::Discharged);
        }

        if self.config.quota_bytes == 0 {
            return Ok(Tick::Continue);
        }

        let ids = self.members.enumerate(&self.supervised.procs_file())?;
        let samples = self.sampler.sample(&ids)?;
        let total = aggregate(&samples);

        if total >= self.config.quota_bytes {
            // Terminate on every breached tick: members that survive the
            // kill, or join mid-episode, must not outlive the breach. The
            // log line stays deduplicated per episode.
            self.supervised.terminate()?;
            if !self.in_breach {
                self.in_breach = true;
                self.breach_episodes += 1;
                warn!(
                    "Quota exceeded. Terminated group {} at {} bytes (quota {}).",
                    self.config.group_name, total, self.config.quota_bytes
                );
            }
        } else {
            self.in_breach = false;
        }

        Ok(Tick::Continue)
    }

    /// Number of breach episodes seen so far; one log line per
    /// contiguous episode.
    pub fn breach_episodes(&self) -> u64 {
        self.breach_episodes
    }

    /// Poll until discharged, then release all handles
    pub fn run(mut self) -> Result<()> {
        loop {
            match self.tick()? {
                Tick::Discharged => break,
                Tick::Continue => std::thread::sleep(self.config.interval),
            }
        }
        self.release();
        Ok(())
    }

    // Discharge path: drop the supervised handle, the sub-group handle,
    // and the signal handle, in that order. Never terminates members.
    fn release(self) {
        let QuotaMonitor {
            supervised,
            protective,
            signal,
            ..
        } = self;
        drop(supervised);
        drop(protective);
        drop(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serial_guard, EnvVarGuard};
    use nix::unistd::{getegid, Group};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _tmp: TempDir,
        _envs: Vec<EnvVarGuard>,
        cgroup_root: PathBuf,
        proc_root: PathBuf,
        runtime_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let cgroup_root = tmp.path().join("cgroup");
        let proc_root = tmp.path().join("proc");
        let runtime_dir = tmp.path().join("run");
        fs::create_dir_all(&cgroup_root).unwrap();
        fs::create_dir_all(&proc_root).unwrap();
        fs::write(cgroup_root.join("cgroup.procs"), "").unwrap();

        let admin = Group::from_gid(getegid()).unwrap().unwrap().name;
        let envs = vec![
            EnvVarGuard::new("PRISON_CGROUP_ROOT", cgroup_root.to_str().unwrap()),
            EnvVarGuard::new("PRISON_PROC_ROOT", proc_root.to_str().unwrap()),
            EnvVarGuard::new("PRISON_RUNTIME_DIR", runtime_dir.to_str().unwrap()),
            EnvVarGuard::new("PRISON_ADMIN_GROUP", &admin),
        ];

        Fixture {
            _tmp: tmp,
            _envs: envs,
            cgroup_root,
            proc_root,
            runtime_dir,
        }
    }

    fn add_member(fx: &Fixture, group: &str, pid: u32, rss_kib: u64) {
        fs::create_dir_all(fx.cgroup_root.join(group)).unwrap();
        let procs = fx.cgroup_root.join(group).join("cgroup.procs");
        let mut listed = fs::read_to_string(&procs).unwrap_or_default();
        listed.push_str(&format!("{}\n", pid));
        fs::write(&procs, listed).unwrap();

        set_member_rss(fx, pid, rss_kib);
    }

    fn set_member_rss(fx: &Fixture, pid: u32, rss_kib: u64) {
        let dir = fx.proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status"),
            format!("VmRSS:\t{} kB\nVmSwap:\t0 kB\nKernelStack:\t0 kB\n", rss_kib),
        )
        .unwrap();
    }

    fn kill_file(fx: &Fixture, group: &str) -> std::path::PathBuf {
        fx.cgroup_root.join(group).join("cgroup.kill")
    }

    fn group_terminated(fx: &Fixture, group: &str) -> bool {
        fs::read_to_string(kill_file(fx, group)).unwrap_or_default() == "1"
    }

    fn test_config(name: &str, quota: u64) -> MonitorConfig {
        let mut config = MonitorConfig::new(name, quota);
        // Hardening mutates the process umask; exercised separately.
        config.harden_acl = false;
        config.self_protect = false;
        config
    }

    fn discharge(fx: &Fixture, group: &str) {
        fs::create_dir_all(&fx.runtime_dir).unwrap();
        fs::write(
            fx.runtime_dir.join(DischargeSignal::signal_name(group)),
            "discharged\n",
        )
        .unwrap();
    }

    #[test]
    fn config_validation() {
        assert!(MonitorConfig::new("cell", 0).validate().is_ok());
        assert!(MonitorConfig::new("", 0).validate().is_err());
        assert!(MonitorConfig::new("a/b", 0).validate().is_err());
    }

    #[test]
    fn monitor_below_quota_never_terminates() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("calm", 1024 * 1024)).unwrap();
        add_member(&fx, "calm", 100, 64); // 64 KiB, well below 1 MiB

        for _ in 0..50 {
            assert_eq!(monitor.tick().unwrap(), Tick::Continue);
        }
        assert!(!group_terminated(&fx, "calm"));
        assert_eq!(monitor.breach_episodes(), 0);
    }

    #[test]
    fn monitor_terminates_on_first_breach_tick() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("greedy", 1024 * 1024)).unwrap();
        add_member(&fx, "greedy", 200, 2048); // 2 MiB > 1 MiB quota

        assert_eq!(monitor.tick().unwrap(), Tick::Continue);
        assert!(group_terminated(&fx, "greedy"));
        assert_eq!(monitor.breach_episodes(), 1);
    }

    #[test]
    fn monitor_terminates_on_every_breached_tick() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("relapse", 1024 * 1024)).unwrap();
        add_member(&fx, "relapse", 700, 2048);
        monitor.tick().unwrap();
        assert!(group_terminated(&fx, "relapse"));

        // The aggregate never dips below quota, so the episode continues.
        // A member joining mid-episode must still be killed on the next
        // tick, not ride out the breach unterminated.
        fs::write(kill_file(&fx, "relapse"), "").unwrap();
        add_member(&fx, "relapse", 701, 4096);
        monitor.tick().unwrap();
        assert!(group_terminated(&fx, "relapse"));
        // Still one contiguous episode, so one log event.
        assert_eq!(monitor.breach_episodes(), 1);
    }

    #[test]
    fn monitor_reports_one_episode_per_contiguous_breach() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("wavy", 1024 * 1024)).unwrap();
        add_member(&fx, "wavy", 300, 2048);

        for _ in 0..10 {
            monitor.tick().unwrap();
        }
        assert_eq!(monitor.breach_episodes(), 1);

        // Usage drops below quota, then breaches again: a second episode.
        set_member_rss(&fx, 300, 16);
        monitor.tick().unwrap();
        set_member_rss(&fx, 300, 4096);
        monitor.tick().unwrap();
        assert_eq!(monitor.breach_episodes(), 2);
    }

    #[test]
    fn monitor_quota_zero_disables_enforcement() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("unmetered", 0)).unwrap();
        add_member(&fx, "unmetered", 400, 1024 * 1024); // 1 GiB

        for _ in 0..20 {
            assert_eq!(monitor.tick().unwrap(), Tick::Continue);
        }
        assert!(!group_terminated(&fx, "unmetered"));
    }

    #[test]
    fn monitor_discharge_wins_over_breach_in_same_tick() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("released", 1024)).unwrap();
        add_member(&fx, "released", 500, 1024 * 1024); // far over quota
        discharge(&fx, "released");

        assert_eq!(monitor.tick().unwrap(), Tick::Discharged);
        assert!(!group_terminated(&fx, "released"));
    }

    #[test]
    fn monitor_run_exits_cleanly_on_discharge() {
        let _guard = serial_guard();
        let fx = fixture();

        discharge(&fx, "short-stay");
        let monitor = QuotaMonitor::start(test_config("short-stay", 4096)).unwrap();
        monitor.run().unwrap();
        assert!(!group_terminated(&fx, "short-stay"));
    }

    #[test]
    fn monitor_vanished_member_is_fatal() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut monitor = QuotaMonitor::start(test_config("raced", 1024)).unwrap();
        // Listed in the group but with no proc entry: the
        // enumerate/sample race surfaces as a fatal error.
        let procs = fx.cgroup_root.join("raced").join("cgroup.procs");
        fs::write(&procs, "999\n").unwrap();

        let err = monitor.tick().unwrap_err();
        assert!(matches!(err, PrisonError::SampleFailed { pid: 999, .. }));
    }

    #[test]
    fn monitor_self_protect_creates_guard_group_with_itself() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut config = test_config("cell-a", 0);
        config.self_protect = true;
        let monitor = QuotaMonitor::start(config).unwrap();

        let guard_procs = fx.cgroup_root.join("cell-a-guard").join("cgroup.procs");
        let listed = fs::read_to_string(&guard_procs).unwrap();
        assert_eq!(listed.trim(), std::process::id().to_string());
        // The supervised group never appears in its guard.
        assert_ne!(
            fx.cgroup_root.join("cell-a"),
            fx.cgroup_root.join("cell-a-guard")
        );
        drop(monitor);
    }

    #[test]
    fn monitor_double_start_fails_on_guard_group() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut config = test_config("cell-b", 0);
        config.self_protect = true;
        let _first = QuotaMonitor::start(config.clone()).unwrap();
        let err = QuotaMonitor::start(config).unwrap_err();
        assert!(matches!(err, PrisonError::GroupExists(_)));
        drop(fx);
    }

    #[test]
    fn monitor_hardening_failure_is_fatal() {
        let _guard = serial_guard();
        let fx = fixture();

        let mut config = test_config("cell-c", 0);
        config.harden_acl = true;
        config.admin_group = "no-such-prison-group".to_string();
        let err = QuotaMonitor::start(config).unwrap_err();
        assert!(matches!(err, PrisonError::SecurityAdjustFailed { .. }));
        // Hardening runs before any object creation.
        assert!(!fx.cgroup_root.join("cell-c").exists());
    }

    #[test]
    fn monitor_aggregates_across_members() {
        let _guard = serial_guard();
        let fx = fixture();

        // Two members at 600 KiB each; quota 1 MiB is only breached by
        // the aggregate, not by either member alone.
        add_member(&fx, "sum", 600, 600);
        add_member(&fx, "sum", 601, 600);

        let mut monitor = QuotaMonitor::start(test_config("sum", 1024 * 1024)).unwrap();
        monitor.tick().unwrap();
        assert_eq!(monitor.breach_episodes(), 1);
        assert!(group_terminated(&fx, "sum"));
    }
}
