//! Docker backend: one throwaway container per execution.
//!
//! Containers run with networking disabled, a read-only root filesystem, all
//! capabilities dropped and memory/cpu/pids limits. The program is streamed
//! over the container's stdin, so its size is not bounded by argv limits. A timed out container is
//! killed with SIGKILL; every container is force-removed afterwards.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{AttachContainerResults, LogOutput},
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder, KillContainerOptionsBuilder,
        LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    },
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{ExitKind, Limits, RawOutput, SandboxBackend};
use crate::errors::ExecutionError;

pub struct DockerBackend {
    docker: Docker,
    image: String,
    /// Interpreter invocation reading the program from stdin.
    command: Vec<String>,
}

impl DockerBackend {
    pub fn connect(image: impl Into<String>) -> Result<Self, ExecutionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutionError::Unavailable(format!("Docker connection failed: {}", e)))?;
        Ok(Self {
            docker,
            image: image.into(),
            command: vec!["python3".into(), "-I".into(), "-".into()],
        })
    }

    async fn ensure_image(&self) -> Result<(), ExecutionError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.image, "Pulling sandbox image");
        let options = CreateImageOptionsBuilder::new()
            .from_image(&self.image)
            .build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| ExecutionError::Unavailable(format!("Image pull failed: {}", e)))?;
        }
        Ok(())
    }

    async fn collect_logs(&self, name: &str, limit: usize) -> (String, bool, String) {
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = self.docker.logs(name, Some(options));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut truncated = false;
        while let Some(Ok(chunk)) = stream.next().await {
            let (target, bytes, is_stdout) = match chunk {
                LogOutput::StdOut { message } => (&mut stdout, message, true),
                LogOutput::StdErr { message } => (&mut stderr, message, false),
                _ => continue,
            };
            let room = limit.saturating_sub(target.len());
            if is_stdout && bytes.len() > room {
                truncated = true;
            }
            target.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
        (
            String::from_utf8_lossy(&stdout).into_owned(),
            truncated,
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }

    async fn attach_stdin(&self, name: &str) -> Result<AttachContainerResults, ExecutionError> {
        let options = AttachContainerOptionsBuilder::new()
            .stdin(true)
            .stream(true)
            .build();
        self.docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| ExecutionError::Unavailable(format!("Container attach failed: {}", e)))
    }

    async fn remove(&self, name: &str) {
        if let Err(e) = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
        {
            warn!(container = name, error = %e, "Failed to remove sandbox container");
        }
    }
}

/// Host limits for a sandbox container.
pub(crate) fn host_config(limits: &Limits) -> HostConfig {
    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), "rw,noexec,size=16m".to_string());
    HostConfig {
        memory: (limits.memory_bytes > 0).then_some(limits.memory_bytes as i64),
        memory_swap: (limits.memory_bytes > 0).then_some(limits.memory_bytes as i64),
        nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
        pids_limit: Some(limits.pids_limit),
        readonly_rootfs: Some(true),
        network_mode: Some("none".to_string()),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        tmpfs: Some(tmpfs),
        ..Default::default()
    }
}

/// Create body for one execution. The command never carries the program;
/// it arrives on stdin, which closes after the first attach detaches.
pub(crate) fn container_body(image: &str, command: &[String], limits: &Limits) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(image.to_string()),
        cmd: Some(command.to_vec()),
        env: Some(vec!["PYTHONDONTWRITEBYTECODE=1".to_string()]),
        user: Some("65534:65534".to_string()),
        working_dir: Some("/tmp".to_string()),
        network_disabled: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        host_config: Some(host_config(limits)),
        ..Default::default()
    }
}

/// Write the program to the attached stdin and close it.
async fn write_program(attached: AttachContainerResults, program: &str) -> Result<(), ExecutionError> {
    let AttachContainerResults { mut input, output } = attached;
    let written = async {
        input.write_all(program.as_bytes()).await?;
        input.flush().await?;
        input.shutdown().await
    }
    .await;
    drop(output);
    written.map_err(|e| ExecutionError::Unavailable(format!("Writing program failed: {}", e)))
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn run(&self, program: &str, limits: &Limits) -> Result<RawOutput, ExecutionError> {
        self.ensure_image().await?;

        let name = format!("modelsmith-exec-{}", uuid::Uuid::new_v4().simple());
        let body = container_body(&self.image, &self.command, limits);
        let options = CreateContainerOptionsBuilder::new().name(&name).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| ExecutionError::Unavailable(format!("Container creation failed: {}", e)))?;

        // Attach before start so no input is lost.
        let attached = match self.attach_stdin(&name).await {
            Ok(attached) => attached,
            Err(e) => {
                self.remove(&name).await;
                return Err(e);
            }
        };
        let started = Instant::now();
        if let Err(e) = self.docker.start_container(&name, None).await {
            self.remove(&name).await;
            return Err(ExecutionError::Unavailable(format!(
                "Container start failed: {}",
                e
            )));
        }
        debug!(container = %name, "Sandbox container started");

        let mut wait = self.docker.wait_container(&name, None);
        let waited = tokio::time::timeout(limits.timeout, async {
            write_program(attached, program).await?;
            Ok::<_, ExecutionError>(wait.next().await)
        })
        .await;
        drop(wait);
        let waited = match waited {
            Ok(Ok(next)) => Ok(next),
            Ok(Err(e)) => {
                self.remove(&name).await;
                return Err(e);
            }
            Err(elapsed) => Err(elapsed),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let exit = match waited {
            Ok(Some(Ok(response))) => ExitKind::Exited(response.status_code),
            // Non-zero exits surface as a wait error carrying the code.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                ExitKind::Exited(code)
            }
            Ok(Some(Err(e))) => {
                self.remove(&name).await;
                return Err(ExecutionError::Unavailable(format!(
                    "Waiting for container failed: {}",
                    e
                )));
            }
            Ok(None) => ExitKind::Exited(-1),
            Err(_) => {
                let kill = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
                if let Err(e) = self.docker.kill_container(&name, Some(kill)).await {
                    warn!(container = %name, error = %e, "Failed to kill timed out container");
                }
                warn!(
                    container = %name,
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Sandbox container timed out"
                );
                ExitKind::TimedOut
            }
        };

        let oom_killed = match self.docker.inspect_container(&name, None).await {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(_) => false,
        };

        let (stdout, stdout_truncated, stderr) = if exit == ExitKind::TimedOut {
            (String::new(), false, String::new())
        } else {
            self.collect_logs(&name, limits.max_output_bytes).await
        };
        self.remove(&name).await;

        let exit = if oom_killed && exit != ExitKind::TimedOut {
            ExitKind::OutOfMemory
        } else {
            exit
        };

        Ok(RawOutput {
            exit,
            stdout,
            stdout_truncated,
            stderr,
            duration_ms,
        })
    }
}
