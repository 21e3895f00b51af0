use thiserror::Error;

#[derive(Error, Debug)]
pub enum RdsError {
    #[error("volume '{0}' not found")]
    VolumeNotFound(String),

    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("volume '{0}' already exists")]
    AlreadyExists(String),

    #[error("not enough space on RDS: {0}")]
    OutOfSpace(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("host key mismatch for {0}")]
    HostKeyMismatch(String),

    #[error("not connected to RDS")]
    NotConnected,

    #[error("rds command failed: {0}")]
    CommandFailed(String),

    #[error("failed to parse rds output: {0}")]
    Parse(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("validation exceeded time budget")]
    ValidationBudgetExceeded,

    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RdsError {
    /// Whether a retry of the same command can be expected to succeed.
    ///
    /// Command-level rejections from the RDS CLI are final; transport-level
    /// failures (timeouts, broken sessions, EOF) are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            RdsError::Ssh(_) | RdsError::Io(_) | RdsError::Timeout(_) | RdsError::NotConnected => {
                true
            }
            RdsError::CommandFailed(msg) => !is_permanent_failure(msg),
            _ => false,
        }
    }
}

/// Error substrings the RDS CLI emits for conditions no retry will fix.
const PERMANENT_FAILURES: &[&str] = &[
    "not enough space",
    "invalid parameter",
    "no such item",
    "authentication failed",
];

pub(crate) fn is_permanent_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    PERMANENT_FAILURES.iter().any(|s| lower.contains(s))
}

pub type Result<T> = std::result::Result<T, RdsError>;
