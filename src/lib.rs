//! prison-rs: guest-side prison enforcement
//!
//! The enforcement half of a process-containment platform. An external
//! orchestrator creates an isolation group (a cgroup v2 directory),
//! attaches member processes, and issues decommission signals; this
//! crate supplies the two guest-side pieces:
//!
//! - **quota monitor** (`prison-guard`): polls group membership and
//!   aggregate memory usage, hardens its own security posture, nests
//!   itself in a fate-sharing protective sub-group, and forcibly
//!   terminates the group when usage reaches the quota.
//! - **launch delegate** (`prison-delegate`): a single-shot helper that
//!   waits for a stdin handshake so the orchestrator can attach it to
//!   the group first, then performs credential- or token-based process
//!   creation and reports the new pid.
//!
//! # Modules
//!
//! - **group**: isolation group handles and the protective sub-group
//! - **members**: membership enumeration with buffer growth
//! - **sampler**: per-process memory sampling and aggregation
//! - **hardening**: monitor self-hardening
//! - **discharge**: the cooperative decommission signal
//! - **monitor**: the quota monitor controller
//! - **launch**: the delegate handshake and dispatch protocol

pub mod errors;
pub mod utils;

pub mod discharge;
pub mod group;
pub mod hardening;
pub mod launch;
pub mod members;
pub mod sampler;

pub mod monitor;

pub use discharge::DischargeSignal;
pub use errors::{PrisonError, Result};
pub use group::IsolationGroup;
pub use launch::{LaunchMethod, LaunchRequest, HANDSHAKE_TOKEN};
pub use members::MemberBuffer;
pub use monitor::{MonitorConfig, QuotaMonitor, Tick};
pub use sampler::{MemberSample, MemoryCounters, MemorySampler};
