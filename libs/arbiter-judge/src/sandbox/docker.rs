//! Docker-backed isolation using Bollard.
//!
//! Each handle is a long-lived container idling on `sleep infinity`; programs
//! are started inside it with `exec`. The container has a read-only root, an
//! anonymous scratch volume at `/sandbox`, a small tmpfs at `/tmp`, no network,
//! no capabilities and `no-new-privileges`. Programs run as `nobody`.

use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, UpdateContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    ExitStatus, IsolationProvider, OutputChunk, ProcessSpec, SandboxFile, SandboxHandle,
    SandboxLimits, SpawnedProcess,
};
use crate::error::SandboxError;
use crate::language::LanguageProfile;

const SCRATCH_ROOT: &str = "/sandbox";
const WORK_DIR_NAME: &str = "work";
const WORKDIR: &str = "/sandbox/work";
const SANDBOX_USER: &str = "65534:65534";
const PIDS_LIMIT: i64 = 64;
const ONE_CPU_NANOS: i64 = 1_000_000_000;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Exit status of a process killed by SIGKILL
const SIGKILL_EXIT: i64 = 137;

pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "Pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Create(format!("pull {}: {}", image, e)))?;
        }

        Ok(())
    }

    fn host_config(limits: &SandboxLimits) -> HostConfig {
        let memory = memory_cap(limits);

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,nosuid,size=64m,mode=1777".to_string());

        HostConfig {
            memory: Some(memory),
            // Equal to memory: no swap
            memory_swap: Some(memory),
            nano_cpus: Some(ONE_CPU_NANOS),
            pids_limit: Some(PIDS_LIMIT),
            readonly_rootfs: Some(true),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(tmpfs),
            mounts: Some(vec![Mount {
                target: Some(SCRATCH_ROOT.to_string()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    async fn start_exec(
        &self,
        handle: &SandboxHandle,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<SpawnedProcess, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(SANDBOX_USER.to_string()),
                    working_dir: Some(WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let (output, mut input) = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Spawn(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(SandboxError::Spawn("exec started detached".to_string()))
            }
        };

        if let Some(bytes) = stdin {
            // Writing from a separate task keeps a program that never reads
            // stdin from blocking the output drain
            tokio::spawn(async move {
                if let Err(e) = input.write_all(&bytes).await {
                    debug!(error = %e, "stdin write interrupted");
                }
                let _ = input.shutdown().await;
            });
        }

        let output = output
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => {
                        Some(Ok(OutputChunk::Stdout(message.to_vec())))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(OutputChunk::Stderr(message.to_vec())))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(SandboxError::from(e))),
                }
            })
            .boxed();

        let docker = self.docker.clone();
        let exec_id = exec.id;
        let container_id = handle.id.clone();
        let exit = async move {
            loop {
                let info = docker
                    .inspect_exec(&exec_id)
                    .await
                    .map_err(|e| SandboxError::Wait(e.to_string()))?;
                if info.running == Some(false) {
                    let code = info.exit_code;
                    let container_oom = if code == Some(SIGKILL_EXIT) {
                        container_oom_killed(&docker, &container_id).await
                    } else {
                        false
                    };
                    return Ok(exec_exit(code, container_oom));
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        }
        .boxed();

        Ok(SpawnedProcess { output, exit })
    }
}

fn memory_cap(limits: &SandboxLimits) -> i64 {
    i64::try_from(limits.memory_bytes()).unwrap_or(i64::MAX)
}

/// Whether the daemon recorded an OOM kill for the container. Handles that
/// hit one are retired, so the sticky flag never leaks into a later run.
async fn container_oom_killed(docker: &Docker, container_id: &str) -> bool {
    match docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => info
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false),
        Err(e) => {
            debug!(container = %container_id, error = %e, "Container inspect failed");
            false
        }
    }
}

/// Exit status of an exec; a SIGKILL alone may be ours or the user's
fn exec_exit(code: Option<i64>, container_oom: bool) -> ExitStatus {
    ExitStatus {
        code,
        signal: code.filter(|c| *c > 128).map(|c| (c - 128) as i32),
        oom_killed: container_oom && code == Some(SIGKILL_EXIT),
    }
}

/// First regular file of a tar archive
fn extract_single(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "archive holds no regular file",
    ))
}

/// Tar archive with a world-writable `work/` directory holding `files`
fn build_archive(files: &[SandboxFile]) -> std::io::Result<Vec<u8>> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o777);
    dir.set_size(0);
    dir.set_mtime(mtime);
    builder.append_data(&mut dir, format!("{}/", WORK_DIR_NAME), std::io::empty())?;

    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(if file.executable { 0o755 } else { 0o644 });
        header.set_mtime(mtime);
        builder.append_data(
            &mut header,
            format!("{}/{}", WORK_DIR_NAME, file.name),
            file.contents.as_slice(),
        )?;
    }

    builder.into_inner()
}

#[async_trait]
impl IsolationProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: SandboxLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        self.ensure_image(&profile.image).await?;

        let name = format!("arbiter-{}-{}", profile.language, uuid::Uuid::new_v4());

        let mut labels = HashMap::new();
        labels.insert("arbiter.language".to_string(), profile.language.to_string());

        let config = ContainerConfig {
            image: Some(profile.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(SCRATCH_ROOT.to_string()),
            network_disabled: Some(true),
            labels: Some(labels),
            host_config: Some(Self::host_config(&limits)),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &container.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(SandboxError::Create(e.to_string()));
        }

        debug!(container = %name, language = %profile.language, "Sandbox container started");

        Ok(SandboxHandle::new(
            container.id,
            profile.language,
            limits,
            profile.layout(WORKDIR),
        ))
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        files: &[SandboxFile],
    ) -> Result<(), SandboxError> {
        let archive = build_archive(files).map_err(|e| SandboxError::Transfer(e.to_string()))?;

        self.docker
            .upload_to_container(
                &handle.id,
                Some(UploadToContainerOptions {
                    path: SCRATCH_ROOT.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| SandboxError::Transfer(e.to_string()))
    }

    async fn download(&self, handle: &SandboxHandle, name: &str) -> Result<Vec<u8>, SandboxError> {
        let mut stream = self.docker.download_from_container(
            &handle.id,
            Some(DownloadFromContainerOptions {
                path: format!("{}/{}", WORKDIR, name),
            }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Transfer(format!("{}: {}", name, e)))?;
            archive.extend_from_slice(&chunk);
        }
        extract_single(&archive).map_err(|e| SandboxError::Transfer(format!("{}: {}", name, e)))
    }

    async fn set_limits(
        &self,
        handle: &SandboxHandle,
        limits: SandboxLimits,
    ) -> Result<(), SandboxError> {
        let memory = memory_cap(&limits);
        self.docker
            .update_container(
                &handle.id,
                UpdateContainerOptions::<String> {
                    memory: Some(memory),
                    memory_swap: Some(memory),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Limits(e.to_string()))?;

        debug!(container = %handle.id, memory_limit_mb = limits.memory_limit_mb, "Sandbox re-capped");
        Ok(())
    }

    async fn spawn(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<SpawnedProcess, SandboxError> {
        // The container-wide cap set at create or by set_limits applies
        self.start_exec(handle, spec.argv, spec.stdin).await
    }

    async fn peak_memory(&self, handle: &SandboxHandle) -> Option<u64> {
        let mut stats = self.docker.stats(
            &handle.id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        match stats.next().await {
            Some(Ok(stats)) => stats.memory_stats.max_usage.or(stats.memory_stats.usage),
            Some(Err(e)) => {
                debug!(error = %e, "Container stats unavailable");
                None
            }
            None => None,
        }
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .kill_container(&handle.id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn reset(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let argv = ["find", WORKDIR, "-mindepth", "1", "-delete"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let process = self.start_exec(handle, argv, None).await?;

        // Drain so the exec can finish, then check it succeeded
        process.output.for_each(|_| async {}).await;
        let status = process.exit.await?;
        if status.success() {
            Ok(())
        } else {
            Err(SandboxError::Reset(format!("cleanup exited with {}", status)))
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let result = self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        if let Err(e) = result {
            warn!(container = %handle.id, error = %e, "Failed to remove sandbox container");
            return Err(SandboxError::Remove(e.to_string()));
        }
        Ok(())
    }
}
