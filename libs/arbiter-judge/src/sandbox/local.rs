//! Process-level fallback provider.
//!
//! Every handle is a private temp directory; programs run as child processes
//! in their own process group with `setrlimit` caps on address space, CPU
//! seconds and core dumps. There is no filesystem or network isolation, so
//! this backend is for development and trusted deployments only. Peak memory
//! is not observable here and is left to the executor's estimate.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use futures_util::FutureExt;
use rlimit::{setrlimit, Resource};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::{
    ExitStatus, IsolationProvider, OutputChunk, ProcessSpec, SandboxFile, SandboxHandle,
    SandboxLimits, SpawnedProcess,
};
use crate::error::SandboxError;
use crate::language::LanguageProfile;

const READ_CHUNK: usize = 8192;
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Default)]
pub struct LocalProvider {
    dirs: Mutex<HashMap<String, TempDir>>,
    /// Process group leaders currently running, by handle id
    running: Arc<Mutex<HashMap<String, u32>>>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn workdir(&self, handle: &SandboxHandle) -> Result<PathBuf, SandboxError> {
        let dirs = self.dirs.lock().unwrap_or_else(PoisonError::into_inner);
        dirs.get(&handle.id)
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| SandboxError::Spawn(format!("unknown sandbox {}", handle.id)))
    }
}

fn pipe_stream<R>(
    reader: R,
    wrap: fn(Vec<u8>) -> OutputChunk,
) -> impl Stream<Item = Result<OutputChunk, SandboxError>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(wrap(buf)), Some(reader)))
            }
            Err(e) => Some((Err(SandboxError::from(e)), None)),
        }
    })
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    ExitStatus {
        code: status.code().map(i64::from),
        signal: status.signal(),
        oom_killed: false,
    }
}

#[async_trait]
impl IsolationProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: SandboxLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("arbiter-")
            .tempdir()
            .map_err(|e| SandboxError::Create(e.to_string()))?;
        let id = format!("local-{}", uuid::Uuid::new_v4());
        let handle = SandboxHandle::new(
            id.clone(),
            profile.language,
            limits,
            profile.layout(dir.path()),
        );

        self.dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, dir);
        Ok(handle)
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        files: &[SandboxFile],
    ) -> Result<(), SandboxError> {
        let workdir = self
            .workdir(handle)
            .map_err(|e| SandboxError::Transfer(e.to_string()))?;

        for file in files {
            let path = workdir.join(&file.name);
            tokio::fs::write(&path, &file.contents)
                .await
                .map_err(|e| SandboxError::Transfer(format!("{}: {}", file.name, e)))?;
            if file.executable {
                let perms = std::fs::Permissions::from_mode(0o755);
                tokio::fs::set_permissions(&path, perms).await?;
            }
        }
        Ok(())
    }

    async fn download(&self, handle: &SandboxHandle, name: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self
            .workdir(handle)
            .map_err(|e| SandboxError::Transfer(e.to_string()))?
            .join(name);
        tokio::fs::read(&path)
            .await
            .map_err(|e| SandboxError::Transfer(format!("{}: {}", name, e)))
    }

    async fn set_limits(
        &self,
        _handle: &SandboxHandle,
        _limits: SandboxLimits,
    ) -> Result<(), SandboxError> {
        // rlimits are applied per spawn from the spec
        Ok(())
    }

    async fn spawn(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<SpawnedProcess, SandboxError> {
        let workdir = self.workdir(handle)?;
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::Spawn("empty argv".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&workdir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &workdir)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(limits) = spec.limits {
            let memory = limits.memory_bytes();
            // Hard CPU cap one second past the wall limit, the watchdog fires first
            let cpu_secs = limits.time_limit_secs.ceil() as u64 + 1;
            unsafe {
                command.pre_exec(move || {
                    setrlimit(Resource::AS, memory, memory)?;
                    setrlimit(Resource::CPU, cpu_secs, cpu_secs)?;
                    setrlimit(Resource::CORE, 0, 0)?;
                    Ok(())
                });
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {}", program, e)))?;

        if let (Some(mut stdin), Some(bytes)) = (child.stdin.take(), spec.stdin) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "stdin write interrupted");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("stderr not captured".to_string()))?;
        let output = stream::select(
            pipe_stream(stdout, OutputChunk::Stdout),
            pipe_stream(stderr, OutputChunk::Stderr),
        )
        .boxed();

        if let Some(pid) = child.id() {
            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(handle.id.clone(), pid);
        }

        let running = Arc::clone(&self.running);
        let handle_id = handle.id.clone();
        let exit = async move {
            let status = child.wait().await;
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&handle_id);
            Ok(exit_status(status.map_err(|e| SandboxError::Wait(e.to_string()))?))
        }
        .boxed();

        Ok(SpawnedProcess { output, exit })
    }

    async fn peak_memory(&self, _handle: &SandboxHandle) -> Option<u64> {
        None
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let pid = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.id)
            .copied();

        if let Some(pid) = pid {
            // Negative pid targets the whole process group
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn reset(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let workdir = self
            .workdir(handle)
            .map_err(|e| SandboxError::Reset(e.to_string()))?;

        let mut entries = tokio::fs::read_dir(&workdir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.map_err(|e| SandboxError::Reset(format!("{}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.kill(handle).await?;
        let dir = self
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
        if let Some(dir) = dir {
            dir.close()
                .map_err(|e| SandboxError::Remove(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{Arg, CommandTemplate};
    use arbiter_common::Language;
    use std::time::Duration;

    fn sh_profile() -> LanguageProfile {
        LanguageProfile {
            language: Language::Python,
            image: String::new(),
            source_file: "main.sh".to_string(),
            extensions: vec![".sh".to_string()],
            compile: None,
            run: CommandTemplate::new(vec![Arg::lit("sh"), Arg::Source]),
        }
    }

    async fn collect(process: SpawnedProcess) -> (String, String, ExitStatus) {
        let chunks: Vec<_> = process.output.collect().await;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for chunk in chunks {
            match chunk.unwrap() {
                OutputChunk::Stdout(bytes) => stdout.extend(bytes),
                OutputChunk::Stderr(bytes) => stderr.extend(bytes),
            }
        }
        let status = process.exit.await.unwrap();
        (
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
            status,
        )
    }

    #[tokio::test]
    async fn test_runs_program_with_stdin() {
        let provider = LocalProvider::new();
        let profile = sh_profile();
        let handle = provider
            .create(&profile, SandboxLimits::new(2.0, 256))
            .await
            .unwrap();

        provider
            .upload(&handle, &[SandboxFile::new("main.sh", "read x; echo \"got $x\"; echo oops >&2")])
            .await
            .unwrap();

        let process = provider
            .spawn(
                &handle,
                ProcessSpec {
                    argv: profile.run.build(&handle.layout),
                    stdin: Some(b"42\n".to_vec()),
                    limits: Some(handle.limits),
                },
            )
            .await
            .unwrap();

        let (stdout, stderr, status) = collect(process).await;
        assert_eq!(stdout, "got 42\n");
        assert_eq!(stderr, "oops\n");
        assert!(status.success());

        provider.destroy(&handle).await.unwrap();
        assert!(!handle.layout.workdir.exists());
    }

    #[tokio::test]
    async fn test_kill_terminates_process_group() {
        let provider = LocalProvider::new();
        let profile = sh_profile();
        let handle = provider
            .create(&profile, SandboxLimits::new(10.0, 256))
            .await
            .unwrap();
        provider
            .upload(&handle, &[SandboxFile::new("main.sh", "sleep 30; echo late")])
            .await
            .unwrap();

        let process = provider
            .spawn(
                &handle,
                ProcessSpec {
                    argv: profile.run.build(&handle.layout),
                    stdin: None,
                    limits: Some(handle.limits),
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        provider.kill(&handle).await.unwrap();

        let (stdout, _, status) = tokio::time::timeout(Duration::from_secs(5), collect(process))
            .await
            .expect("killed process group should close its pipes");
        assert_eq!(stdout, "");
        assert_eq!(status.signal, Some(libc::SIGKILL));

        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_reads_back_build_output() {
        let provider = LocalProvider::new();
        let profile = sh_profile();
        let handle = provider
            .create(&profile, SandboxLimits::new(2.0, 256))
            .await
            .unwrap();
        provider
            .upload(&handle, &[SandboxFile::new("main.sh", "printf built > main")])
            .await
            .unwrap();

        let process = provider
            .spawn(
                &handle,
                ProcessSpec {
                    argv: profile.run.build(&handle.layout),
                    stdin: None,
                    limits: None,
                },
            )
            .await
            .unwrap();
        let (_, _, status) = collect(process).await;
        assert!(status.success());

        assert_eq!(provider.download(&handle, "main").await.unwrap(), b"built".to_vec());
        assert!(matches!(
            provider.download(&handle, "absent").await,
            Err(SandboxError::Transfer(_))
        ));
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_empties_workdir() {
        let provider = LocalProvider::new();
        let handle = provider
            .create(&sh_profile(), SandboxLimits::new(1.0, 64))
            .await
            .unwrap();
        provider
            .upload(
                &handle,
                &[SandboxFile::new("main.sh", "true"), SandboxFile::new("input.txt", "1")],
            )
            .await
            .unwrap();
        std::fs::create_dir(handle.layout.workdir.join("leftover")).unwrap();

        provider.reset(&handle).await.unwrap();

        let remaining = std::fs::read_dir(&handle.layout.workdir).unwrap().count();
        assert_eq!(remaining, 0);
        provider.destroy(&handle).await.unwrap();
    }
}
