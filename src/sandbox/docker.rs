//! Docker CLI runtime
//!
//! Drives `docker` (or a CLI-compatible runtime such as podman) through
//! `tokio::process`. Every container gets the same hardened flag set; the
//! profile only tunes the numeric ceilings.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::output::{spawn_reader, OutputCapture};
use super::runtime::{ContainerOutcome, ContainerRuntime, ContainerSpec, WORKSPACE};
use crate::error::EngineError;

/// nobody:nogroup
const SANDBOX_USER: &str = "65534:65534";
const NOFILE_LIMIT: u32 = 256;

/// Upper bound for management calls (kill, rm, inspect, version)
const CLI_TIMEOUT: Duration = Duration::from_secs(15);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// `docker run` reports its own failures as 125 (daemon) and 126/127
/// (entrypoint), but passes the program's status through unchanged
const RUNTIME_EXIT_CODES: [i32; 3] = [125, 126, 127];

/// `State.StartedAt` of a container whose process never ran
const ZERO_TIME_PREFIX: &str = "0001-01-01";

pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a management command, returning stdout on success
    async fn cli(&self, args: &[&str], limit: Duration) -> Result<String, EngineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| {
                EngineError::RuntimeUnavailable(format!(
                    "`{} {}` did not answer within {:?}",
                    self.binary,
                    args.join(" "),
                    limit
                ))
            })?
            .map_err(|e| {
                EngineError::RuntimeUnavailable(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(EngineError::RuntimeUnavailable(format!(
                "`{} {}` failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Whether the daemon ever started the container's process
    async fn started(&self, name: &str) -> Result<bool, EngineError> {
        let started_at = self
            .cli(&["inspect", "--format", "{{.State.StartedAt}}", name], CLI_TIMEOUT)
            .await?;
        Ok(has_started(&started_at))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: &ContainerSpec, stdin: Option<&str>) -> Result<ContainerOutcome, EngineError> {
        debug!(container = %spec.name, image = %spec.image, "Launching container");

        let mut cmd = Command::new(&self.binary);
        cmd.args(run_args(spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::RuntimeUnavailable(format!("failed to spawn {}: {}", self.binary, e))
        })?;

        // Detached writer so a program that never reads stdin cannot stall us;
        // dropping the pipe closes it
        let input = stdin.map(|s| s.as_bytes().to_vec());
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                if let Some(data) = input {
                    let _ = pipe.write_all(&data).await;
                }
                let _ = pipe.shutdown().await;
            });
        }

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone());
        }
        drop(tx);

        let mut capture = OutputCapture::new(spec.output_limit);
        let waited = {
            let collect = async {
                while let Some(chunk) = rx.recv().await {
                    capture.push(&chunk);
                }
            };
            tokio::time::timeout(spec.timeout, async {
                let (status, ()) = tokio::join!(child.wait(), collect);
                status
            })
            .await
        };

        let (exit_code, timed_out) = match waited {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                debug!(container = %spec.name, "Wall-clock limit reached, killing");
                if let Err(e) = self.kill(&spec.name).await {
                    warn!(container = %spec.name, "Kill after timeout failed: {}", e);
                }
                let _ = child.kill().await;
                (None, true)
            }
        };

        let (output, truncated) = capture.finish();

        // Output and exit code are under the program's control, so only the
        // container state can tell a launch failure from a user exit
        if let Some(code) = exit_code.filter(|c| RUNTIME_EXIT_CODES.contains(c)) {
            let started = match self.started(&spec.name).await {
                Ok(started) => started,
                Err(e) if is_gone(&e) => false,
                Err(e) => return Err(e),
            };
            if !started {
                return Err(EngineError::Launch {
                    container: spec.name.clone(),
                    detail: format!("exit status {}: {}", code, output.trim()),
                });
            }
        }

        Ok(ContainerOutcome {
            exit_code,
            timed_out,
            output,
            truncated,
        })
    }

    async fn kill(&self, name: &str) -> Result<(), EngineError> {
        match self.cli(&["kill", "--signal", "KILL", name], CLI_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        match self.cli(&["rm", "-f", name], CLI_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn oom_killed(&self, name: &str) -> Result<bool, EngineError> {
        let out = self
            .cli(&["inspect", "--format", "{{.State.OOMKilled}}", name], CLI_TIMEOUT)
            .await?;
        Ok(out == "true")
    }

    async fn version(&self) -> Result<String, EngineError> {
        self.cli(&["version", "--format", "{{.Server.Version}}"], CLI_TIMEOUT)
            .await
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.cli(&["image", "inspect", image], CLI_TIMEOUT).await.is_ok() {
            return Ok(());
        }
        info!("Pulling image {}", image);
        self.cli(&["pull", "--quiet", image], PULL_TIMEOUT).await?;
        Ok(())
    }
}

/// Full `docker run` argument list for `spec`
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mount_mode = if spec.workspace_writable { "rw" } else { "ro" };

    let mut args = vec![
        "run".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "-i".to_string(),
        "--network=none".to_string(),
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        format!("/tmp:rw,nosuid,size={}m", spec.tmpfs_mb),
        format!("--memory={}m", spec.memory_mb),
        format!("--memory-swap={}m", spec.memory_mb),
        format!("--cpus={}", spec.cpus),
        format!("--pids-limit={}", spec.pids),
        "--cap-drop=ALL".to_string(),
        "--security-opt=no-new-privileges".to_string(),
        format!("--user={}", SANDBOX_USER),
        "--ulimit".to_string(),
        format!("nofile={0}:{0}", NOFILE_LIMIT),
        "-v".to_string(),
        format!("{}:{}:{}", spec.workspace.display(), WORKSPACE, mount_mode),
        "-w".to_string(),
        WORKSPACE.to_string(),
    ];

    for var in &spec.env {
        args.push("-e".to_string());
        args.push(var.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn has_started(started_at: &str) -> bool {
    let started_at = started_at.trim();
    !started_at.is_empty() && !started_at.starts_with(ZERO_TIME_PREFIX)
}

fn is_gone(err: &EngineError) -> bool {
    let text = err.to_string();
    text.contains("No such container")
        || text.contains("No such object")
        || text.contains("is not running")
}
