use nix::sys::signal::Signal;
use std::{fmt, time::Duration};
use thiserror::Error;

/// How the child process ended, as observed by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(Signal),
    Other(String),
}

impl ChildStatus {
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, ChildStatus::Exited(0))
    }

    /// Exit code the launcher itself should report for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildStatus::Exited(code) => *code,
            ChildStatus::Signaled(signal) => 128 + *signal as i32,
            ChildStatus::Other(_) => 1,
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exited with code {code}"),
            ChildStatus::Signaled(signal) => write!(f, "killed by signal {signal:?}"),
            ChildStatus::Other(status) => write!(f, "terminated abnormally ({status})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("setup failed before the child could run")]
    Setup(#[source] anyhow::Error),

    #[error("user namespace handshake failed")]
    Handshake(#[from] HandshakeError),

    #[error("child {0}")]
    Child(ChildStatus),
}

impl SpawnError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SpawnError::Child(status) if !status.success() => status.exit_code(),
            _ => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("short {op}: transferred {actual} of {expected} bytes")]
    ShortTransfer {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("peer closed the channel")]
    PeerClosed,

    #[error("no message from peer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected value {0} in child report")]
    UnexpectedReport(i32),

    #[error("parent refused the identity change (code {0})")]
    Refused(i32),

    #[error("channel i/o failed")]
    Io(#[from] nix::Error),

    #[error("failed to encode message")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode message")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no program to execute")]
    MissingProgram,

    #[error("{field} must be an absolute path, got {value:?}")]
    RelativePath { field: &'static str, value: String },

    #[error("{0} requires a root filesystem path")]
    RequiresRootfs(&'static str),

    #[error("environment entry {0:?} is not KEY=VALUE")]
    MalformedEnv(String),

    #[error("{field} contains an interior NUL byte")]
    InteriorNul { field: &'static str },
}

/// A failed best-effort step. Reported, never fatal.
#[derive(Debug)]
pub struct AdvisoryFailure {
    pub step: &'static str,
    pub error: anyhow::Error,
}

/// Collects best-effort failures alongside a successful result.
#[derive(Debug, Default)]
pub struct Advisory {
    failures: Vec<AdvisoryFailure>,
}

impl Advisory {
    pub fn record<E>(&mut self, step: &'static str, error: E)
    where
        E: Into<anyhow::Error>,
    {
        let error = error.into();
        tracing::warn!(step, error = %format!("{error:#}"), "best-effort step failed");
        self.failures.push(AdvisoryFailure { step, error });
    }

    /// Runs `f` and records its error instead of propagating it.
    pub fn attempt<F>(&mut self, step: &'static str, f: F)
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        if let Err(error) = f() {
            self.record(step, error);
        }
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[AdvisoryFailure] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn test_child_status_exit_code() {
        assert!(ChildStatus::Exited(0).success());
        assert_eq!(ChildStatus::Exited(3).exit_code(), 3);
        assert_eq!(ChildStatus::Signaled(Signal::SIGKILL).exit_code(), 137);
        assert!(!ChildStatus::Other("stopped".into()).success());
    }

    #[test]
    fn test_spawn_error_is_never_zero() {
        assert_eq!(SpawnError::Child(ChildStatus::Exited(0)).exit_code(), 1);
        assert_eq!(SpawnError::Child(ChildStatus::Exited(7)).exit_code(), 7);
        assert_eq!(
            SpawnError::Handshake(HandshakeError::PeerClosed).exit_code(),
            1
        );
    }

    #[test]
    fn test_advisory_collects_without_failing() {
        let mut advisory = Advisory::default();
        advisory.attempt("ok", || Ok(()));
        assert!(advisory.is_clean());

        advisory.attempt("expose old root", || Err(anyhow!("EINVAL")));
        assert!(!advisory.is_clean());
        assert_eq!(advisory.failures()[0].step, "expose old root");
    }

    #[test]
    fn test_advisory_keeps_error_chain() {
        let mut advisory = Advisory::default();
        advisory.attempt("expose old root", || {
            Err(anyhow!("ENOENT: No such file or directory"))
                .context("Couldn't bind old root at /nonexistent")
        });

        let message = format!("{:#}", advisory.failures()[0].error);
        assert!(message.contains("Couldn't bind old root"));
        assert!(message.contains("ENOENT"));
    }
}
