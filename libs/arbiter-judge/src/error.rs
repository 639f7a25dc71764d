use std::io;

use thiserror::Error;

/// Faults raised by an isolation provider
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("unable to create sandbox: {0}")]
    Create(String),
    #[error("unable to transfer files into sandbox: {0}")]
    Transfer(String),
    #[error("unable to start process in sandbox: {0}")]
    Spawn(String),
    #[error("unable to wait for sandboxed process: {0}")]
    Wait(String),
    #[error("unable to apply sandbox limits: {0}")]
    Limits(String),
    #[error("unable to reset sandbox scratch area: {0}")]
    Reset(String),
    #[error("unable to remove sandbox: {0}")]
    Remove(String),
    #[error("sandbox I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("docker error: {source}")]
    Docker {
        #[from]
        source: bollard::errors::Error,
    },
}

/// Judge error taxonomy
///
/// Per-test variants are degraded into verdicts by the runner; the
/// submission-level ones end up as the submission's terminal error.
#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("sandbox creation failed: {0}")]
    SandboxCreation(#[source] SandboxError),
    #[error("time limit exceeded after {0:.3}s")]
    ExecutionTimeout(f64),
    #[error("memory limit of {0}MB exceeded")]
    ResourceExceeded(u64),
    #[error("process exited with code {0}")]
    NonZeroExit(i64),
    #[error("missing artifact: {0}")]
    MissingArtifact(String),
    #[error("missing expected output: {0}")]
    MissingExpectedOutput(String),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid constraints: {0}")]
    InvalidConstraints(String),
    #[error("invalid source file: {0}")]
    InvalidSource(String),
    #[error("internal scheduling error: {0}")]
    InternalScheduling(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub type Result<T, E = JudgeError> = std::result::Result<T, E>;
