//! Single-shot privileged launch delegate
//!
//! Takes no arguments: the launch request arrives through environment
//! variables and the handshake through stdin. The orchestrator attaches
//! this process to the isolation group while it blocks on the
//! handshake, so the worker created afterwards inherits membership.
//! Exit status doubles as the error channel: 0 with the worker pid on
//! stdout, 1 for a refused handshake or malformed environment, the OS
//! error code for a failed creation.

use std::io;

use log::error;
use prison_rs::{launch, LaunchRequest};

fn main() {
    env_logger::init();

    let stdin = io::stdin();
    if !launch::read_handshake(&mut stdin.lock()) {
        std::process::exit(1);
    }

    let request = match LaunchRequest::from_env() {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid launch environment: {}", e);
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    match launch::dispatch(&request) {
        Ok(pid) => println!("{}", pid),
        Err(e) => {
            error!("Process creation failed: {}", e);
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
