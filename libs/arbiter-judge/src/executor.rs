/// Sandbox Executor - Builds and Program Runs
///
/// **Core Responsibility:**
/// Compile a submission once in its own sandbox, then move the resulting
/// program and each input into a leased sandbox, run it under an independent
/// wall-clock watchdog, drain its output and classify the run.
///
/// **Critical Properties:**
/// - Knows nothing about expected outputs or verdicts
/// - Never decides whether a handle is pooled, only whether it is healthy
/// - The scratch area is reset on every exit path once files were uploaded
/// - Compiler memory and time are never charged to a test run
///
/// **Classification (first match wins):**
/// 1. Watchdog fired, or wall time above the limit → TLE
/// 2. Isolation layer reported an OOM kill → MLE
/// 3. Authoritative peak memory above the limit → MLE
/// 4. Clean exit → OK
/// 5. Anything else → RTE
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbiter_common::{Config, ExecutionResult, RawOutcome, ResourceConstraints};
use futures_util::stream::{BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::error::{JudgeError, Result, SandboxError};
use crate::language::{LanguageProfile, ScratchLayout};
use crate::sandbox::{
    ExitStatus, HandleState, IsolationProvider, OutputChunk, ProcessSpec, SandboxFile,
    SandboxHandle, SandboxLimits, SpawnedProcess,
};

const MIB: u64 = 1024 * 1024;

pub const TLE_OUTPUT: &str = "Time Limit Exceeded";
pub const MLE_OUTPUT: &str = "Memory Limit Exceeded";
pub const RTE_OUTPUT: &str = "Runtime Error";

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub compile_timeout: Duration,
    /// Memory cap of the sandbox a build runs in
    pub compile_memory_mb: u64,
    /// Per stream; anything beyond is drained and discarded
    pub output_limit_bytes: usize,
    /// How long to wait for streams to close after a kill
    pub kill_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(10),
            compile_memory_mb: 512,
            output_limit_bytes: 1024 * 1024,
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            compile_timeout: config.compile_timeout,
            compile_memory_mb: config.compile_memory_limit_mb,
            output_limit_bytes: config.output_limit_bytes,
            ..Self::default()
        }
    }

    /// Limits to lease a build sandbox with
    pub fn compile_limits(&self) -> SandboxLimits {
        SandboxLimits::new(self.compile_timeout.as_secs_f64(), self.compile_memory_mb)
    }
}

/// Files every test run starts from: the source, or a built binary
#[derive(Debug, Clone)]
pub struct Program {
    files: Vec<SandboxFile>,
}

impl Program {
    pub fn interpreted(profile: &LanguageProfile, code: &[u8]) -> Self {
        Self {
            files: vec![SandboxFile::new(profile.source_file.clone(), code)],
        }
    }

    pub fn compiled(binary: Vec<u8>) -> Self {
        Self {
            files: vec![SandboxFile {
                name: ScratchLayout::binary_name().to_string(),
                contents: binary,
                executable: true,
            }],
        }
    }

    pub fn files(&self) -> &[SandboxFile] {
        &self.files
    }
}

#[derive(Debug, Clone)]
pub enum Build {
    Ready(Program),
    /// Compiler rejected the code, ran out of time or out of memory
    Failed { message: String, stderr: String },
}

/// Result of a build plus whether its handle may be reused
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub build: Build,
    pub healthy: bool,
}

/// What every test of a submission reports when its build failed
pub fn build_failure(test_id: &str, message: &str, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        stderr: stderr.to_string(),
        ..ExecutionResult::failed(test_id, message)
    }
}

/// Result of one run plus whether the handle may be reused
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: ExecutionResult,
    pub healthy: bool,
}

/// What was observed about a finished (or killed) run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunObservation {
    pub timed_out: bool,
    pub elapsed_secs: f64,
    pub status: Option<ExitStatus>,
    pub peak_memory_bytes: Option<u64>,
    /// Peak memory reflects this program alone
    pub memory_authoritative: bool,
}

pub fn classify(observation: &RunObservation, constraints: &ResourceConstraints) -> RawOutcome {
    if observation.timed_out || observation.elapsed_secs > constraints.time_limit_secs {
        return RawOutcome::Tle;
    }
    let Some(status) = observation.status else {
        return RawOutcome::Rte;
    };
    if status.oom_killed {
        return RawOutcome::Mle;
    }
    if observation.memory_authoritative {
        if let Some(peak) = observation.peak_memory_bytes {
            if peak > constraints.memory_limit_mb.saturating_mul(MIB) {
                return RawOutcome::Mle;
            }
        }
    }
    if status.success() {
        RawOutcome::Ok
    } else {
        RawOutcome::Rte
    }
}

/// Error describing why a run did not finish cleanly, `None` for OK
pub fn run_fault(
    outcome: RawOutcome,
    observation: &RunObservation,
    constraints: &ResourceConstraints,
) -> Option<JudgeError> {
    match outcome {
        RawOutcome::Ok => None,
        RawOutcome::Tle => Some(JudgeError::ExecutionTimeout(observation.elapsed_secs)),
        RawOutcome::Mle => Some(JudgeError::ResourceExceeded(constraints.memory_limit_mb)),
        RawOutcome::Rte => Some(JudgeError::NonZeroExit(
            observation
                .status
                .and_then(|status| status.code)
                .unwrap_or(-1),
        )),
    }
}

/// Keeps printable ASCII, newlines and tabs, then trims both ends
pub fn sanitize(bytes: &[u8]) -> String {
    let kept: String = bytes
        .iter()
        .filter(|&&b| (0x20..=0x7e).contains(&b) || b == b'\n' || b == b'\t')
        .map(|&b| b as char)
        .collect();
    kept.trim().to_string()
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(buffer: &mut Vec<u8>, bytes: &[u8], limit: usize, truncated: &mut bool) {
        let room = limit.saturating_sub(buffer.len());
        if bytes.len() > room {
            *truncated = true;
        }
        buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn total_bytes(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

async fn collect_output(
    mut output: BoxStream<'static, std::result::Result<OutputChunk, SandboxError>>,
    limit: usize,
) -> Captured {
    let mut captured = Captured::default();
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(OutputChunk::Stdout(bytes)) => {
                Captured::push(&mut captured.stdout, &bytes, limit, &mut captured.truncated)
            }
            Ok(OutputChunk::Stderr(bytes)) => {
                Captured::push(&mut captured.stderr, &bytes, limit, &mut captured.truncated)
            }
            Err(e) => {
                warn!(error = %e, "output stream failed");
                break;
            }
        }
    }
    captured
}

struct Supervised {
    status: Option<ExitStatus>,
    captured: Captured,
    timed_out: bool,
    elapsed: Duration,
}

pub struct SandboxExecutor {
    provider: Arc<dyn IsolationProvider>,
    settings: ExecutorSettings,
}

impl SandboxExecutor {
    pub fn new(provider: Arc<dyn IsolationProvider>, settings: ExecutorSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Compiles `code` inside `handle` and reads the binary back out
    ///
    /// Interpreted profiles need no build and get their source back as is.
    pub async fn build(
        &self,
        handle: &mut SandboxHandle,
        profile: &LanguageProfile,
        code: &[u8],
    ) -> Result<BuildOutcome> {
        let Some(compile) = &profile.compile else {
            return Ok(BuildOutcome {
                build: Build::Ready(Program::interpreted(profile, code)),
                healthy: true,
            });
        };

        self.upload_with_retry(handle, Program::interpreted(profile, code).files())
            .await?;
        let spec = ProcessSpec {
            argv: compile.build(&handle.layout),
            stdin: None,
            limits: None,
        };
        let outcome = self.compile(handle, spec).await;

        let reset_ok = self.reset(handle).await;
        let (build, clean) = outcome?;
        Ok(BuildOutcome {
            build,
            healthy: reset_ok && clean,
        })
    }

    /// Returns the build and whether the handle came out of it intact
    async fn compile(&self, handle: &mut SandboxHandle, spec: ProcessSpec) -> Result<(Build, bool)> {
        let run = self
            .supervise(handle, spec, self.settings.compile_timeout)
            .await?;
        let stderr = sanitize(&run.captured.stderr);

        if run.timed_out {
            warn!(sandbox = %handle.id, "compilation timed out");
            let build = Build::Failed {
                message: "Compilation timed out".to_string(),
                stderr,
            };
            return Ok((build, false));
        }

        match run.status {
            Some(status) if status.success() => {
                let binary = self
                    .provider
                    .download(handle, ScratchLayout::binary_name())
                    .await?;
                debug!(sandbox = %handle.id, bytes = binary.len(), "compiled");
                Ok((Build::Ready(Program::compiled(binary)), true))
            }
            status => {
                let oom = status.is_some_and(|s| s.oom_killed);
                let mut diagnostics = run.captured.stderr.clone();
                diagnostics.extend_from_slice(&run.captured.stdout);
                let message = match sanitize(&diagnostics) {
                    _ if oom => "Compilation exceeded its memory allowance".to_string(),
                    m if m.is_empty() => "Compilation Error".to_string(),
                    m => m,
                };
                debug!(sandbox = %handle.id, oom, "compilation failed");
                Ok((Build::Failed { message, stderr }, !oom))
            }
        }
    }

    /// Runs `program` once against `input` inside `handle`
    ///
    /// Errors are internal faults (transfer failed twice, spawn failed); the
    /// handle is unhealthy in that case and the caller should not pool it.
    pub async fn execute(
        &self,
        handle: &mut SandboxHandle,
        profile: &LanguageProfile,
        program: &Program,
        input: Option<&[u8]>,
        constraints: &ResourceConstraints,
        test_id: &str,
    ) -> Result<RunOutcome> {
        let mut files = program.files().to_vec();
        if let Some(input) = input {
            files.push(SandboxFile::new(ScratchLayout::input_name(), input));
        }
        self.upload_with_retry(handle, &files).await?;

        let outcome = self.run(handle, profile, input, constraints, test_id).await;

        let reset_ok = self.reset(handle).await;
        let (result, timed_out) = outcome?;
        // An OOM-killed cgroup keeps its flag and its high-water mark
        let healthy = reset_ok && !timed_out && result.outcome != RawOutcome::Mle;
        Ok(RunOutcome { result, healthy })
    }

    async fn reset(&self, handle: &mut SandboxHandle) -> bool {
        let reset_ok = match self.provider.reset(handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(sandbox = %handle.id, error = %e, "scratch reset failed");
                false
            }
        };
        handle.state = HandleState::Exited;
        reset_ok
    }

    async fn upload_with_retry(&self, handle: &SandboxHandle, files: &[SandboxFile]) -> Result<()> {
        match self.provider.upload(handle, files).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(sandbox = %handle.id, error = %first, "upload failed, retrying once");
                self.provider.upload(handle, files).await?;
                Ok(())
            }
        }
    }

    /// Returns the result and whether anything had to be killed
    async fn run(
        &self,
        handle: &mut SandboxHandle,
        profile: &LanguageProfile,
        input: Option<&[u8]>,
        constraints: &ResourceConstraints,
        test_id: &str,
    ) -> Result<(ExecutionResult, bool)> {
        let limits = SandboxLimits::from_constraints(constraints);
        let spec = ProcessSpec {
            argv: profile.run.build(&handle.layout),
            stdin: input.map(|bytes| bytes.to_vec()),
            limits: Some(limits),
        };
        let limit = Duration::from_secs_f64(constraints.time_limit_secs.max(0.0));
        let run = self.supervise(handle, spec, limit).await?;

        let peak = self.provider.peak_memory(handle).await;
        // Container-wide readings include earlier runs in a reused handle
        let memory_authoritative = peak.is_some() && handle.runs == 1;
        let observation = RunObservation {
            timed_out: run.timed_out,
            elapsed_secs: run.elapsed.as_secs_f64(),
            status: run.status,
            peak_memory_bytes: peak,
            memory_authoritative,
        };
        let outcome = classify(&observation, constraints);
        if let Some(fault) = run_fault(outcome, &observation, constraints) {
            debug!(sandbox = %handle.id, test = test_id, %fault, "run did not finish cleanly");
        }

        let memory_used_mb = match peak {
            Some(bytes) if memory_authoritative => bytes.div_ceil(MIB),
            Some(bytes) => bytes.min(limits.memory_bytes()).div_ceil(MIB),
            None => (run.captured.total_bytes() as u64).div_ceil(MIB).max(1),
        };
        let output = match outcome {
            RawOutcome::Ok => sanitize(&run.captured.stdout),
            RawOutcome::Tle => TLE_OUTPUT.to_string(),
            RawOutcome::Mle => MLE_OUTPUT.to_string(),
            RawOutcome::Rte => {
                let stderr = sanitize(&run.captured.stderr);
                if stderr.is_empty() {
                    RTE_OUTPUT.to_string()
                } else {
                    stderr
                }
            }
        };

        debug!(
            sandbox = %handle.id,
            test = test_id,
            outcome = ?outcome,
            elapsed_secs = observation.elapsed_secs,
            memory_used_mb,
            truncated = run.captured.truncated,
            "run classified"
        );

        Ok((
            ExecutionResult {
                test_id: test_id.to_string(),
                outcome,
                output,
                stderr: sanitize(&run.captured.stderr),
                time_used_secs: round_millis(observation.elapsed_secs),
                memory_used_mb,
                memory_advisory: !memory_authoritative,
            },
            run.timed_out,
        ))
    }

    /// Races exit plus output drain against a watchdog of `limit`
    async fn supervise(
        &self,
        handle: &mut SandboxHandle,
        spec: ProcessSpec,
        limit: Duration,
    ) -> Result<Supervised> {
        let SpawnedProcess { output, exit } = self.provider.spawn(handle, spec).await?;
        handle.state = HandleState::Running;
        handle.runs += 1;
        let started = Instant::now();

        let finished = async {
            let (status, captured) =
                tokio::join!(exit, collect_output(output, self.settings.output_limit_bytes));
            (status, captured)
        };
        tokio::pin!(finished);

        let (status, captured, timed_out) = tokio::select! {
            (status, captured) = &mut finished => (Some(status), captured, false),
            _ = tokio::time::sleep(limit) => {
                debug!(sandbox = %handle.id, limit_secs = limit.as_secs_f64(), "watchdog fired");
                if let Err(e) = self.provider.kill(handle).await {
                    warn!(sandbox = %handle.id, error = %e, "kill failed");
                }
                match tokio::time::timeout(self.settings.kill_grace, &mut finished).await {
                    Ok((status, captured)) => (Some(status), captured, true),
                    Err(_) => (None, Captured::default(), true),
                }
            }
        };
        let elapsed = started.elapsed();
        handle.state = HandleState::Exited;

        let status = match status {
            Some(Ok(status)) => Some(status),
            // Exit is unknowable once the process was killed
            Some(Err(e)) if timed_out => {
                debug!(error = %e, "wait failed after kill");
                None
            }
            Some(Err(e)) => return Err(JudgeError::Sandbox(e)),
            None => None,
        };

        Ok(Supervised {
            status,
            captured,
            timed_out,
            elapsed,
        })
    }
}

fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}
