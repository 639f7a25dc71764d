//! Scripted provider for unit tests.
//!
//! Handles enforce their memory cap the way a cgroup would: a run whose
//! scripted peak exceeds the handle's current limit is OOM-killed. A
//! successful run whose argv names `-o <path>` leaves a file at that path
//! holding the source, standing in for a compiler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use tokio::sync::Notify;

use super::{
    ExitStatus, IsolationProvider, OutputChunk, ProcessSpec, SandboxFile, SandboxHandle,
    SandboxLimits, SpawnedProcess,
};
use crate::error::SandboxError;
use crate::language::{LanguageProfile, ScratchLayout};

/// What the scripted program was started with
#[derive(Debug, Clone)]
pub struct FakeInvocation {
    pub argv: Vec<String>,
    /// Source file, or the built binary when only that was uploaded
    pub source: String,
    pub stdin: String,
}

impl FakeInvocation {
    pub fn is_compile(&self) -> bool {
        self.argv.iter().any(|arg| arg == "-o")
    }
}

/// Scripted result of one spawn
#[derive(Debug, Clone)]
pub struct FakeRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: Duration,
    pub oom_killed: bool,
    pub peak_memory: Option<u64>,
}

impl FakeRun {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::ZERO,
            oom_killed: false,
            peak_memory: Some(4 * 1024 * 1024),
        }
    }

    pub fn exit(code: i64, stderr: &str) -> Self {
        Self {
            exit_code: code,
            stderr: stderr.to_string(),
            ..Self::ok("")
        }
    }

    pub fn sleeping(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::ok("")
        }
    }

    pub fn with_peak(mut self, bytes: Option<u64>) -> Self {
        self.peak_memory = bytes;
        self
    }
}

type Script = dyn Fn(&FakeInvocation) -> FakeRun + Send + Sync;

struct HandleState {
    files: HashMap<String, Vec<u8>>,
    peak: Option<u64>,
    limits: SandboxLimits,
}

impl HandleState {
    fn new(limits: SandboxLimits) -> Self {
        Self {
            files: HashMap::new(),
            peak: None,
            limits,
        }
    }
}

pub struct FakeProvider {
    script: Box<Script>,
    handles: Mutex<HashMap<String, HandleState>>,
    kills: Mutex<HashMap<String, Arc<Notify>>>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub killed: AtomicUsize,
    pub uploads: AtomicUsize,
    pub recaps: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_set_limits: AtomicBool,
    /// Number of upcoming uploads that fail
    pub upload_failures: AtomicUsize,
}

impl FakeProvider {
    pub fn new(script: impl Fn(&FakeInvocation) -> FakeRun + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            handles: Mutex::new(HashMap::new()),
            kills: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            recaps: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_set_limits: AtomicBool::new(false),
            upload_failures: AtomicUsize::new(0),
        }
    }

    /// Echoes stdin back, like `cat`
    pub fn echo() -> Self {
        Self::new(|inv| FakeRun::ok(&inv.stdin))
    }

    pub fn live_handles(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Memory cap currently enforced on a live handle
    pub fn limits_of(&self, id: &str) -> Option<SandboxLimits> {
        self.handles.lock().unwrap().get(id).map(|state| state.limits)
    }

    fn kill_signal(&self, id: &str) -> Arc<Notify> {
        self.kills
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

/// File name a compiler invocation writes, from `-o <path>`
fn output_path(argv: &[String]) -> Option<String> {
    let at = argv.iter().position(|arg| arg == "-o")?;
    let path = argv.get(at + 1)?;
    Some(path.rsplit('/').next().unwrap_or(path).to_string())
}

#[async_trait]
impl IsolationProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: SandboxLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Create("scripted failure".to_string()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{}", n);
        self.handles
            .lock()
            .unwrap()
            .insert(id.clone(), HandleState::new(limits));
        Ok(SandboxHandle::new(
            id,
            profile.language,
            limits,
            profile.layout("/sandbox/work"),
        ))
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        files: &[SandboxFile],
    ) -> Result<(), SandboxError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let pending = self.upload_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.upload_failures.store(pending - 1, Ordering::SeqCst);
            return Err(SandboxError::Transfer("scripted failure".to_string()));
        }
        let mut handles = self.handles.lock().unwrap();
        let state = handles
            .get_mut(&handle.id)
            .ok_or_else(|| SandboxError::Transfer(format!("unknown sandbox {}", handle.id)))?;
        for file in files {
            state.files.insert(file.name.clone(), file.contents.clone());
        }
        Ok(())
    }

    async fn spawn(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<SpawnedProcess, SandboxError> {
        let (source, cap) = {
            let handles = self.handles.lock().unwrap();
            let state = handles
                .get(&handle.id)
                .ok_or_else(|| SandboxError::Spawn(format!("unknown sandbox {}", handle.id)))?;
            let source = state
                .files
                .get(&handle.layout.source_file)
                .or_else(|| state.files.get(ScratchLayout::binary_name()))
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            (source, state.limits.memory_bytes())
        };
        let invocation = FakeInvocation {
            argv: spec.argv,
            source,
            stdin: spec
                .stdin
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default(),
        };
        let run = (self.script)(&invocation);
        let over_cap = run.peak_memory.is_some_and(|peak| peak > cap);

        if let Some(state) = self.handles.lock().unwrap().get_mut(&handle.id) {
            state.peak = run.peak_memory.map(|peak| peak.min(cap));
            let built = run.exit_code == 0 && !run.oom_killed && !over_cap;
            if let (true, Some(output)) = (built, output_path(&invocation.argv)) {
                state.files.insert(output, invocation.source.clone().into_bytes());
            }
        }

        let kill = self.kill_signal(&handle.id);
        let duration = run.duration;
        let status = if run.oom_killed || over_cap {
            ExitStatus {
                code: Some(137),
                signal: Some(9),
                oom_killed: true,
            }
        } else {
            ExitStatus {
                code: Some(run.exit_code),
                signal: None,
                oom_killed: false,
            }
        };
        let exit = async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(status),
                _ = kill.notified() => Ok(ExitStatus::from_code(137)),
            }
        }
        .boxed();

        let mut chunks = Vec::new();
        if !run.stdout.is_empty() {
            chunks.push(Ok(OutputChunk::Stdout(run.stdout.into_bytes())));
        }
        if !run.stderr.is_empty() {
            chunks.push(Ok(OutputChunk::Stderr(run.stderr.into_bytes())));
        }

        Ok(SpawnedProcess {
            output: stream::iter(chunks).boxed(),
            exit,
        })
    }

    async fn download(&self, handle: &SandboxHandle, name: &str) -> Result<Vec<u8>, SandboxError> {
        self.handles
            .lock()
            .unwrap()
            .get(&handle.id)
            .and_then(|state| state.files.get(name).cloned())
            .ok_or_else(|| SandboxError::Transfer(format!("{}: not found", name)))
    }

    async fn set_limits(
        &self,
        handle: &SandboxHandle,
        limits: SandboxLimits,
    ) -> Result<(), SandboxError> {
        self.recaps.fetch_add(1, Ordering::SeqCst);
        if self.fail_set_limits.load(Ordering::SeqCst) {
            return Err(SandboxError::Limits("scripted failure".to_string()));
        }
        match self.handles.lock().unwrap().get_mut(&handle.id) {
            Some(state) => {
                state.limits = limits;
                Ok(())
            }
            None => Err(SandboxError::Limits(format!("unknown sandbox {}", handle.id))),
        }
    }

    async fn peak_memory(&self, handle: &SandboxHandle) -> Option<u64> {
        self.handles
            .lock()
            .unwrap()
            .get(&handle.id)
            .and_then(|state| state.peak)
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        self.kill_signal(&handle.id).notify_one();
        Ok(())
    }

    async fn reset(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if let Some(state) = self.handles.lock().unwrap().get_mut(&handle.id) {
            state.files.clear();
            state.peak = None;
        }
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().remove(&handle.id);
        self.kills.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}
