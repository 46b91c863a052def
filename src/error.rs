//! Error types for oomward.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal startup errors.
///
/// Each variant maps to a documented process exit code so that service
/// managers and scripts can distinguish misconfiguration from environment
/// problems.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("could not cd to /proc: {0}")]
    ProcChdir(std::io::Error),

    #[error("could not open /proc: {0}")]
    ProcOpen(String),

    #[error("could not compile regex '{pattern}': {source}")]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },

    #[error("failed to read configuration file '{}': {source}", path.display())]
    ConfigOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    BadArgument(String),

    #[error("-r: {0}")]
    BadReportInterval(String),

    #[error("{flag}: {msg}")]
    BadMemThreshold { flag: &'static str, msg: String },

    #[error("{flag}: {msg}")]
    BadSwapThreshold { flag: &'static str, msg: String },
}

impl SetupError {
    /// Exit code reported to the service manager.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProcChdir(_) => 4,
            Self::ProcOpen(_) => 5,
            Self::BadRegex { .. } => 6,
            Self::ConfigOpen { .. } => 7,
            Self::BadArgument(_) => 13,
            Self::BadReportInterval(_) => 14,
            Self::BadMemThreshold { .. } => 15,
            Self::BadSwapThreshold { .. } => 16,
        }
    }
}

/// Result type alias for startup operations.
pub type Result<T, E = SetupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        let io = || std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(SetupError::ProcChdir(io()).exit_code(), 4);
        assert_eq!(SetupError::ProcOpen("denied".into()).exit_code(), 5);
        assert_eq!(
            SetupError::ConfigOpen {
                path: "/etc/oomward.conf".into(),
                source: io(),
            }
            .exit_code(),
            7
        );
        assert_eq!(SetupError::BadArgument("extra".into()).exit_code(), 13);
        assert_eq!(SetupError::BadReportInterval("nope".into()).exit_code(), 14);
        assert_eq!(
            SetupError::BadMemThreshold {
                flag: "-m",
                msg: "bad".into()
            }
            .exit_code(),
            15
        );
        assert_eq!(
            SetupError::BadSwapThreshold {
                flag: "-s",
                msg: "bad".into()
            }
            .exit_code(),
            16
        );
    }

    #[test]
    fn test_bad_regex_exit_code() {
        let source = regex::Regex::new("(").unwrap_err();
        let err = SetupError::BadRegex {
            pattern: "(".into(),
            source,
        };
        assert_eq!(err.exit_code(), 6);
        assert!(err.to_string().contains("could not compile regex"));
    }
}
