use thiserror::Error;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to resolve address: {0}")]
    Resolve(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("{0} timeout")]
    Timeout(TimeoutKind),
    #[error("unknown rcmd module \"{0}\"")]
    UnknownRcmd(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse hosts file {path}: {reason}")]
    HostsFile { path: String, reason: String },
    #[error("failed to launch worker for {host}: {reason}")]
    Spawn { host: String, reason: String },
    #[error("aborted: {0}")]
    Aborted(String),
}

/// Which of the two per-worker time domains ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Command,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Connect => write!(f, "connect"),
            TimeoutKind::Command => write!(f, "command"),
        }
    }
}

pub type Result<T> = std::result::Result<T, FanoutError>;
