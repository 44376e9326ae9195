//! Quota guard daemon for one prison isolation group

use std::time::Duration;

use clap::Parser;
use log::error;
use prison_rs::{MonitorConfig, QuotaMonitor};

#[derive(Parser)]
#[command(name = "prison-guard")]
#[command(about = "Guards an isolation group against its memory quota", long_about = None)]
struct Cli {
    /// Isolation group name
    group: String,

    /// Memory quota in bytes (0 disables enforcement)
    #[arg(value_parser = prison_rs::utils::parse_quota_bytes)]
    quota_bytes: u64,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Skip security hardening at startup
    #[arg(long)]
    no_harden: bool,

    /// Do not nest the guard in a protective sub-group
    #[arg(long)]
    no_self_protect: bool,

    /// Administrators group granted access to guard-created objects
    #[arg(long)]
    admin_group: Option<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = MonitorConfig::new(&cli.group, cli.quota_bytes);
    config.interval = Duration::from_millis(cli.interval_ms);
    config.harden_acl = !cli.no_harden;
    config.self_protect = !cli.no_self_protect;
    if let Some(admin_group) = cli.admin_group {
        config.admin_group = admin_group;
    }

    if let Err(e) = QuotaMonitor::start(config).and_then(QuotaMonitor::run) {
        error!("Guard failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
