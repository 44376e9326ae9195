//! Privileged launch delegate protocol
//!
//! The delegate is a single-shot helper started by the orchestrator. It
//! blocks on a one-line stdin handshake so the orchestrator can attach
//! the delegate to the isolation group first; only then does it create
//! the real worker process, which inherits group membership. The launch
//! request arrives entirely through environment variables; the new pid
//! leaves through stdout.

use std::io::BufRead;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::unistd::User;

use crate::errors::{PrisonError, Result};
use crate::utils;

/// The literal handshake line released by the orchestrator once the
/// delegate has been attached to the isolation group.
pub const HANDSHAKE_TOKEN: &str = "CreateProcess";

// Launch flags carried over from the orchestrator's contract.
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const LOGON_WITH_PROFILE: u32 = 0x0000_0001;

/// How the worker's credentials are established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMethod {
    /// Credential-based creation: resolve the named account and switch
    /// to its uid/gid before exec.
    LogonCreate {
        username: String,
        domain: String,
        password: String,
    },
    /// Token-based creation: a pre-acquired numeric identity.
    TokenCreate { token: u32 },
}

/// One launch request, constructed once from the environment and
/// consumed exactly once
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub method: LaunchMethod,
    pub command_line: String,
    pub creation_flags: u32,
    pub logon_flags: u32,
    /// None means inherit the delegate's working directory
    pub current_directory: Option<PathBuf>,
    /// None means the default display surface
    pub desktop: Option<String>,
}

impl LaunchRequest {
    /// Parse the request from the process environment. Any missing or
    /// malformed required variable is a fatal configuration error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key).ok_or_else(|| PrisonError::MissingEnv(key.to_string()))
        };
        let required_u32 = |key: &str| -> Result<u32> {
            required(key)?.trim().parse().map_err(|_| {
                PrisonError::InvalidConfig(format!("{} must be an integer", key))
            })
        };

        let method = match required("Method")?.as_str() {
            "CreateProcessWithLogonW" => LaunchMethod::LogonCreate {
                username: required("Username")?,
                domain: required("Domain")?,
                password: required("Password")?,
            },
            "CreateProcessWithTokenW" => LaunchMethod::TokenCreate {
                token: required_u32("Token")?,
            },
            other => {
                return Err(PrisonError::InvalidConfig(format!(
                    "Unknown launch method: {}",
                    other
                )))
            }
        };

        let current_directory = match required("CurrentDirectory")?.as_str() {
            "" => None,
            dir => Some(PathBuf::from(dir)),
        };
        let desktop = match required("Desktop")?.as_str() {
            "" => None,
            name => Some(name.to_string()),
        };

        Ok(Self {
            method,
            command_line: required("CommandLine")?,
            creation_flags: required_u32("CreationFlags")?,
            logon_flags: required_u32("LogonFlags")?,
            current_directory,
            desktop,
        })
    }
}

/// Split a command line into argv.
///
/// Double quotes group words containing whitespace and a backslash
/// escapes a quote; an unterminated quote runs to the end of the line.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            '\\' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    argv.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        argv.push(current);
    }
    argv
}

/// Block for the handshake line. Returns true only for the exact token;
/// end-of-input or any other line refuses the launch.
pub fn read_handshake(reader: &mut impl BufRead) -> bool {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => line.trim_end_matches(['\r', '\n']) == HANDSHAKE_TOKEN,
    }
}

struct Identity {
    uid: u32,
    gid: Option<u32>,
    home: Option<PathBuf>,
    username: Option<String>,
}

fn resolve_identity(method: &LaunchMethod) -> Result<Identity> {
    match method {
        LaunchMethod::LogonCreate { username, .. } => {
            let user = User::from_name(username)
                .map_err(|e| {
                    PrisonError::LaunchFailed(std::io::Error::from_raw_os_error(e as i32))
                })?
                .ok_or_else(|| {
                    PrisonError::LaunchFailed(std::io::Error::from_raw_os_error(libc::ENOENT))
                })?;
            Ok(Identity {
                uid: user.uid.as_raw(),
                gid: Some(user.gid.as_raw()),
                home: Some(user.dir),
                username: Some(user.name),
            })
        }
        LaunchMethod::TokenCreate { token } => Ok(Identity {
            uid: *token,
            gid: None,
            home: None,
            username: None,
        }),
    }
}

/// Create the worker process described by `request`.
///
/// On success the child handle is dropped immediately: the delegate
/// retains no ownership of the worker, whose lifecycle belongs to the
/// isolation group and the orchestrator. Returns the new pid.
pub fn dispatch(request: &LaunchRequest) -> Result<u32> {
    let identity = resolve_identity(&request.method)?;

    let argv = split_command_line(&request.command_line);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PrisonError::InvalidConfig("CommandLine is empty".to_string()))?;

    let mut command = Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());

    if let Some(dir) = &request.current_directory {
        command.current_dir(dir);
    }
    if let Some(desktop) = &request.desktop {
        command.env("DISPLAY", desktop);
    }
    if request.logon_flags & LOGON_WITH_PROFILE != 0 {
        if let Some(home) = &identity.home {
            command.env("HOME", home);
        }
        if let Some(name) = &identity.username {
            command.env("USER", name);
            command.env("LOGNAME", name);
        }
    }

    let uid = identity.uid;
    let gid = identity.gid;
    // An unprivileged delegate launching as itself skips the redundant
    // id switch; everything else attempts it and lets the kernel refuse.
    let switch_ids = utils::is_root() || uid != unsafe { libc::geteuid() } as u32;
    let new_process_group = request.creation_flags & CREATE_NEW_PROCESS_GROUP != 0;
    unsafe {
        command.pre_exec(move || {
            if new_process_group && libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if switch_ids {
                if let Some(gid) = gid {
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(PrisonError::LaunchFailed)?;
    let pid = child.id();
    drop(child);
    Ok(pid)
}
