//! Local interpreter backend.
//!
//! Each execution spawns a fresh interpreter with an empty environment (only
//! PATH and a UTF-8 locale), the program on stdin, its own process group, an
//! address-space rlimit and a zero file-size rlimit so nothing can be written
//! to disk. With network isolation on, the child also gets fresh user and
//! network namespaces with no interfaces but loopback; if the kernel refuses
//! them the spawn fails rather than running unisolated. On timeout the whole
//! process group is killed.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::{ExitKind, Limits, RawOutput, SandboxBackend};
use crate::errors::ExecutionError;

pub struct ProcessBackend {
    command: Vec<String>,
    path_env: String,
    isolate_network: bool,
}

impl ProcessBackend {
    pub fn new(command: Vec<String>, path_env: impl Into<String>) -> Result<Self, ExecutionError> {
        if command.is_empty() {
            return Err(ExecutionError::Unavailable(
                "sandbox interpreter command is empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            path_env: path_env.into(),
            isolate_network: false,
        })
    }

    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    fn build_command(&self, limits: &Limits) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env_clear()
            .env("PATH", &self.path_env)
            .env("LANG", "C.UTF-8")
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let memory_bytes = limits.memory_bytes;
            #[cfg(target_os = "linux")]
            let isolate_network = self.isolate_network;
            // SAFETY: only async-signal-safe libc calls run between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if memory_bytes > 0 {
                        let limit = libc::rlimit {
                            rlim_cur: memory_bytes as libc::rlim_t,
                            rlim_max: memory_bytes as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    let no_files = libc::rlimit {
                        rlim_cur: 0,
                        rlim_max: 0,
                    };
                    if libc::setrlimit(libc::RLIMIT_FSIZE, &no_files) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    #[cfg(target_os = "linux")]
                    if isolate_network
                        && libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) != 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        #[cfg(not(target_os = "linux"))]
        if self.isolate_network {
            tracing::warn!("Network isolation is only available on Linux; running without it");
        }
        #[cfg(not(unix))]
        let _ = limits;

        cmd
    }
}

/// Kill every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: plain kill(2) on a negative pid targets the process group.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Read to EOF, keeping at most `limit` bytes. The rest is drained so the
/// writer never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut truncated = false;
    let Some(mut reader) = reader else {
        return (buf, truncated);
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(&self, program: &str, limits: &Limits) -> Result<RawOutput, ExecutionError> {
        let started = Instant::now();
        let mut child = self.build_command(limits).spawn().map_err(|e| {
            ExecutionError::Unavailable(format!("Failed to spawn '{}': {}", self.command[0], e))
        })?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let source = program.as_bytes().to_vec();

        let write_program = async move {
            if let Some(mut stdin) = stdin {
                // A program that exits early closes the pipe; that is not our failure.
                let _ = stdin.write_all(&source).await;
                let _ = stdin.shutdown().await;
            }
        };

        let outcome = tokio::time::timeout(limits.timeout, async {
            let (_, out, err, status) = tokio::join!(
                write_program,
                read_bounded(stdout, limits.max_output_bytes),
                read_bounded(stderr, limits.max_output_bytes),
                child.wait(),
            );
            (out, err, status)
        })
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(((stdout, stdout_truncated), (stderr, _), status)) => {
                let status = status.map_err(|e| {
                    ExecutionError::Unavailable(format!("Failed to wait for sandbox process: {}", e))
                })?;
                let exit = match status.code() {
                    Some(code) => ExitKind::Exited(code as i64),
                    None => {
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            ExitKind::Signaled(status.signal().unwrap_or(0))
                        }
                        #[cfg(not(unix))]
                        {
                            ExitKind::Signaled(0)
                        }
                    }
                };
                Ok(RawOutput {
                    exit,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stdout_truncated,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    duration_ms,
                })
            }
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                tracing::warn!(
                    pid = ?pid,
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Sandbox process timed out, killed process group"
                );
                Ok(RawOutput {
                    exit: ExitKind::TimedOut,
                    stdout: String::new(),
                    stdout_truncated: false,
                    stderr: String::new(),
                    duration_ms,
                })
            }
        }
    }
}
