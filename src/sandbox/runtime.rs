//! Container runtime abstraction
//!
//! The sandbox protocol (staging, compile/run sequencing, teardown) is
//! written against this trait; `DockerRuntime` is the production
//! implementation. Tests substitute an in-memory fake.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;

/// Workspace mount point inside every container
pub const WORKSPACE: &str = "/workspace";

/// Everything needed to launch one isolated container.
///
/// The isolation flags themselves (no network, read-only root, dropped
/// capabilities, unprivileged user) are not represented here: every
/// runtime applies them unconditionally.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name
    pub name: String,
    pub image: String,
    /// argv executed inside the container
    pub command: Vec<String>,
    /// KEY=VALUE pairs
    pub env: Vec<String>,
    /// Host staging directory mounted at `WORKSPACE`
    pub workspace: PathBuf,
    /// Mount the workspace read-write (compile) instead of read-only (run)
    pub workspace_writable: bool,
    pub memory_mb: u32,
    pub cpus: f32,
    pub pids: u32,
    pub tmpfs_mb: u32,
    /// Wall-clock limit, enforced by the runtime with a hard kill
    pub timeout: Duration,
    /// Combined output cap in bytes
    pub output_limit: usize,
}

/// What came back from one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOutcome {
    /// None if killed by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Combined stdout/stderr, in arrival order
    pub output: String,
    pub truncated: bool,
}

impl ContainerOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch the container, feed stdin (closing it right away when None),
    /// and wait for exit or timeout. User-code failures are `Ok`; only an
    /// inability to launch is `Err`.
    async fn run(&self, spec: &ContainerSpec, stdin: Option<&str>) -> Result<ContainerOutcome, EngineError>;

    /// Hard-kill a container. A container that is already gone is not an error.
    async fn kill(&self, name: &str) -> Result<(), EngineError>;

    /// Force-remove a container. A container that is already gone is not an error.
    async fn remove(&self, name: &str) -> Result<(), EngineError>;

    /// Whether the kernel OOM killer ended the container
    async fn oom_killed(&self, name: &str) -> Result<bool, EngineError>;

    /// Runtime (daemon) version, used as a liveness probe
    async fn version(&self) -> Result<String, EngineError>;

    /// Make sure `image` is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;
}
