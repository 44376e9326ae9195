//! Error types for prison enforcement operations

use std::io;
use thiserror::Error;

/// Result type for prison operations
pub type Result<T> = std::result::Result<T, PrisonError>;

/// Errors that can occur while guarding or launching into a prison
#[derive(Error, Debug)]
pub enum PrisonError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Group query failed: {context}: {source}")]
    QueryFailed { context: String, source: io::Error },

    #[error("Member id buffer exhausted at {capacity} entries")]
    BufferExhausted { capacity: usize },

    #[error("Memory sampling failed for pid {pid}: {context}: {source}")]
    SampleFailed {
        pid: u32,
        context: String,
        source: io::Error,
    },

    #[error("Security adjustment failed: {context}: {source}")]
    SecurityAdjustFailed { context: String, source: io::Error },

    #[error("Isolation group already exists: {0}")]
    GroupExists(String),

    #[error("Group operation failed: {context}: {source}")]
    Group { context: String, source: io::Error },

    #[error("Signal operation failed: {context}: {source}")]
    Signal { context: String, source: io::Error },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Process creation failed: {0}")]
    LaunchFailed(io::Error),
}

impl PrisonError {
    /// Map an error to a process exit code.
    ///
    /// Fatal conditions carry the underlying OS error code where one
    /// exists so the orchestrator can read it from the exit status;
    /// configuration-class errors collapse to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            PrisonError::Io(e)
            | PrisonError::LaunchFailed(e)
            | PrisonError::QueryFailed { source: e, .. }
            | PrisonError::SampleFailed { source: e, .. }
            | PrisonError::SecurityAdjustFailed { source: e, .. }
            | PrisonError::Group { source: e, .. }
            | PrisonError::Signal { source: e, .. } => e.raw_os_error().unwrap_or(1),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PrisonError::BufferExhausted { capacity: 1 << 20 };
        assert!(err.to_string().contains("1048576"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = PrisonError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_exit_code_from_os_error() {
        let io_err = io::Error::from_raw_os_error(libc::ENOENT);
        let err = PrisonError::Io(io_err);
        assert_eq!(err.exit_code(), libc::ENOENT);
    }

    #[test]
    fn test_exit_code_for_launch_failure() {
        let io_err = io::Error::from_raw_os_error(libc::EACCES);
        let err = PrisonError::LaunchFailed(io_err);
        assert_eq!(err.exit_code(), libc::EACCES);
    }

    #[test]
    fn test_exit_code_carries_os_error_for_fatal_group_failure() {
        let err = PrisonError::Group {
            context: "cannot create isolation group /bad/cell".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOTDIR),
        };
        assert_eq!(err.exit_code(), libc::ENOTDIR);
    }

    #[test]
    fn test_exit_code_carries_os_error_for_fatal_sample_failure() {
        let err = PrisonError::SampleFailed {
            pid: 7,
            context: "/proc/7/status".to_string(),
            source: io::Error::from_raw_os_error(libc::ESRCH),
        };
        assert_eq!(err.exit_code(), libc::ESRCH);
    }

    #[test]
    fn test_exit_code_without_os_error_falls_back_to_one() {
        let err = PrisonError::QueryFailed {
            context: "member list is not valid UTF-8".to_string(),
            source: io::Error::from(io::ErrorKind::InvalidData),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_for_config_error() {
        let err = PrisonError::InvalidConfig("bad quota".to_string());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(7)
        }
        assert_eq!(returns_result().unwrap(), 7);
    }
}
