/// Isolation Provider - Abstraction for Sandboxed Environments
///
/// **Core Responsibility:**
/// Create an isolated environment, move files into it, run argv commands
/// inside it and hand back raw streams and exit status.
///
/// **Architectural Boundary:**
/// - Providers know HOW to isolate (containers, rlimited processes, ...)
/// - Providers do NOT know about watchdogs, verdicts or pooling
/// - The executor drives the run; the pool decides handle lifetimes
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use arbiter_common::{Backend, Language, ResourceConstraints};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::SandboxError;
use crate::language::{LanguageProfile, ScratchLayout};

pub mod docker;
pub mod local;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerProvider;
pub use local::LocalProvider;

const MIB: u64 = 1024 * 1024;

/// Limits a sandbox was provisioned with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxLimits {
    pub time_limit_secs: f64,
    pub memory_limit_mb: u64,
}

impl SandboxLimits {
    pub fn new(time_limit_secs: f64, memory_limit_mb: u64) -> Self {
        Self {
            time_limit_secs,
            memory_limit_mb,
        }
    }

    pub fn from_constraints(constraints: &ResourceConstraints) -> Self {
        Self::new(constraints.time_limit_secs, constraints.memory_limit_mb)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(MIB)
    }

    /// True when these limits meet or exceed `requested`
    pub fn satisfies(&self, requested: &SandboxLimits) -> bool {
        self.memory_limit_mb >= requested.memory_limit_mb
            && self.time_limit_secs >= requested.time_limit_secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Running,
    Exited,
    Removed,
}

/// An isolated environment, leased to one execution at a time
#[derive(Debug)]
pub struct SandboxHandle {
    pub id: String,
    pub language: Language,
    pub limits: SandboxLimits,
    pub layout: ScratchLayout,
    pub created_at: Instant,
    pub state: HandleState,
    /// Programs run in this handle so far
    pub runs: u32,
}

impl SandboxHandle {
    pub fn new(
        id: impl Into<String>,
        language: Language,
        limits: SandboxLimits,
        layout: ScratchLayout,
    ) -> Self {
        Self {
            id: id.into(),
            language,
            limits,
            layout,
            created_at: Instant::now(),
            state: HandleState::Created,
            runs: 0,
        }
    }
}

/// File placed into the scratch area, `name` is relative to the workdir
#[derive(Debug, Clone)]
pub struct SandboxFile {
    pub name: String,
    pub contents: Vec<u8>,
    pub executable: bool,
}

impl SandboxFile {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
            executable: false,
        }
    }
}

/// What to start inside a sandbox
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// Per-run caps, `None` for compile steps. Backends that cap the whole
    /// sandbox instead rely on the handle's provisioned limits.
    pub limits: Option<SandboxLimits>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus {
    pub code: Option<i64>,
    pub signal: Option<i32>,
    /// Reported by the isolation layer, not inferred from output
    pub oom_killed: bool,
}

impl ExitStatus {
    pub fn from_code(code: i64) -> Self {
        Self {
            code: Some(code),
            signal: None,
            oom_killed: false,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none() && !self.oom_killed
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (_, Some(signal)) => write!(f, "signal {}", signal),
            (Some(code), None) => write!(f, "exit code {}", code),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// A started process: its merged output streams and its exit
pub struct SpawnedProcess {
    pub output: BoxStream<'static, Result<OutputChunk, SandboxError>>,
    pub exit: BoxFuture<'static, Result<ExitStatus, SandboxError>>,
}

/// Isolation provider trait
///
/// Any implementation must guarantee:
/// 1. No network access from inside the sandbox (where the backend can)
/// 2. Memory capped at the handle's current limits for processes spawned with limits
/// 3. `kill` force-terminates everything started in the handle
/// 4. `destroy` releases every resource the handle holds
/// 5. An OOM kill is only reported when the isolation layer recorded one
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: SandboxLimits,
    ) -> Result<SandboxHandle, SandboxError>;

    async fn upload(&self, handle: &SandboxHandle, files: &[SandboxFile])
        -> Result<(), SandboxError>;

    /// Reads a file back out of the workdir, e.g. a compiled binary
    async fn download(&self, handle: &SandboxHandle, name: &str) -> Result<Vec<u8>, SandboxError>;

    /// Re-caps an existing handle. The caller updates `handle.limits` once
    /// this returns `Ok`.
    async fn set_limits(
        &self,
        handle: &SandboxHandle,
        limits: SandboxLimits,
    ) -> Result<(), SandboxError>;

    async fn spawn(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<SpawnedProcess, SandboxError>;

    /// Best-effort peak memory in bytes, `None` when the backend cannot tell
    async fn peak_memory(&self, handle: &SandboxHandle) -> Option<u64>;

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Empties the scratch area so the handle can be reused
    async fn reset(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Builds the provider selected in configuration
pub fn provider_for(backend: Backend) -> Result<Arc<dyn IsolationProvider>, SandboxError> {
    Ok(match backend {
        Backend::Docker => Arc::new(DockerProvider::connect()?),
        Backend::Local => Arc::new(LocalProvider::new()),
    })
}
