//! Execution sandbox
//!
//! Owns one run end to end: stage the source into a fresh directory, run
//! the optional compile step, run the program, then tear everything down.
//! Teardown happens on every path. A run whose future is dropped halfway
//! (caller timeout, task abort) is cleaned up from `Drop`.
//!
//! The sandbox module does NOT:
//! - Decide whether code may run (that's the gate's job)
//! - Rewrite source (that's the normalizer's job)
//! - Know which container runtime is behind `ContainerRuntime`

pub mod docker;
pub mod output;
pub mod runtime;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use docker::DockerRuntime;
pub use runtime::{ContainerOutcome, ContainerRuntime, ContainerSpec};

use crate::error::EngineError;
use crate::languages::LanguageProfile;
use crate::normalizer::NormalizedSource;
use crate::result::{assemble, ExecutionResult, RawOutcome};

/// How long past a container's own limit the sandbox keeps waiting on the
/// runtime before declaring a timeout itself
const RUNTIME_GRACE: Duration = Duration::from_secs(2);

/// Fail fast at startup if the runtime does not answer
pub async fn ensure_runtime_available(runtime: &dyn ContainerRuntime) -> Result<String, EngineError> {
    let version = runtime.version().await?;
    if version.is_empty() {
        return Err(EngineError::RuntimeUnavailable(
            "runtime reported an empty server version".to_string(),
        ));
    }
    Ok(version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Compile,
    Run,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Step::Compile => "compile",
            Step::Run => "run",
        }
    }
}

#[derive(Debug, Clone)]
struct LaunchedContainer {
    name: String,
    /// Exited on its own; no kill needed before removal
    finished: bool,
}

/// One execution attempt and the resources it owns
struct SandboxRun {
    run_id: Uuid,
    staging_dir: PathBuf,
    started: Instant,
    containers: Vec<LaunchedContainer>,
    runtime: Arc<dyn ContainerRuntime>,
    torn_down: bool,
}

impl SandboxRun {
    fn new(runtime: Arc<dyn ContainerRuntime>, staging_root: &Path) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            staging_dir: staging_root.join(format!("run-{}", run_id)),
            started: Instant::now(),
            containers: Vec::new(),
            runtime,
            torn_down: false,
        }
    }

    fn container_name(&self, step: Step) -> String {
        format!("exec-{}-{}", self.run_id, step.as_str())
    }

    async fn teardown(&mut self) {
        self.torn_down = true;
        teardown(
            self.runtime.as_ref(),
            self.run_id,
            &self.containers,
            &self.staging_dir,
        )
        .await;
    }
}

impl Drop for SandboxRun {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }

        warn!(run_id = %self.run_id, "Run abandoned before teardown, cleaning up in background");
        let runtime = self.runtime.clone();
        let run_id = self.run_id;
        let containers: Vec<_> = self
            .containers
            .iter()
            .map(|c| LaunchedContainer {
                name: c.name.clone(),
                finished: false,
            })
            .collect();
        let dir = self.staging_dir.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    teardown(runtime.as_ref(), run_id, &containers, &dir).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_dir_all(&dir);
            }
        }
    }
}

/// Kill what may still be running, remove every container, remove the
/// staging directory. Failures are logged and never propagated.
async fn teardown(
    runtime: &dyn ContainerRuntime,
    run_id: Uuid,
    containers: &[LaunchedContainer],
    staging_dir: &Path,
) {
    for container in containers {
        if !container.finished {
            if let Err(e) = runtime.kill(&container.name).await {
                warn!(%run_id, container = %container.name, "Failed to kill container: {}", e);
            }
        }
        if let Err(e) = runtime.remove(&container.name).await {
            warn!(%run_id, container = %container.name, "Failed to remove container: {}", e);
        }
    }

    if let Err(e) = fs::remove_dir_all(staging_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(%run_id, path = %staging_dir.display(), "Failed to remove staging directory: {}", e);
        }
    }
}

pub struct ExecutionSandbox {
    runtime: Arc<dyn ContainerRuntime>,
    staging_root: PathBuf,
    max_output_bytes: usize,
}

impl ExecutionSandbox {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        staging_root: impl Into<PathBuf>,
        max_output_bytes: usize,
    ) -> Self {
        // Bind mounts need an absolute host path
        let staging_root = staging_root.into();
        let staging_root = if staging_root.is_absolute() {
            staging_root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&staging_root))
                .unwrap_or(staging_root)
        };

        Self {
            runtime,
            staging_root,
            max_output_bytes,
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Pull every profile image so the first request does not pay for it
    pub async fn prepull(&self, profiles: &[Arc<LanguageProfile>]) -> Result<(), EngineError> {
        for profile in profiles {
            self.runtime.ensure_image(&profile.image).await?;
            info!(language = %profile.key, image = %profile.image, "Image ready");
        }
        Ok(())
    }

    /// Execute `source` under `profile`.
    ///
    /// User-code failures come back as `Ok(ExecutionResult)`. `Err` means
    /// the environment failed (staging, runtime). Either way every resource
    /// of the run has been released before this returns.
    pub async fn run(
        &self,
        profile: &LanguageProfile,
        source: &NormalizedSource,
        stdin: Option<&str>,
    ) -> Result<ExecutionResult, EngineError> {
        let mut run = SandboxRun::new(self.runtime.clone(), &self.staging_root);
        debug!(run_id = %run.run_id, language = %profile.key, "Starting sandbox run");

        let outcome = self.run_steps(&mut run, profile, source, stdin).await;
        run.teardown().await;

        match &outcome {
            Ok(result) => info!(
                run_id = %run.run_id,
                language = %profile.key,
                failure = %result.failure,
                duration_seconds = result.duration_seconds,
                "Run finished"
            ),
            Err(e) => error!(
                run_id = %run.run_id,
                language = %profile.key,
                "Environment fault: {}",
                e
            ),
        }
        outcome
    }

    async fn run_steps(
        &self,
        run: &mut SandboxRun,
        profile: &LanguageProfile,
        source: &NormalizedSource,
        stdin: Option<&str>,
    ) -> Result<ExecutionResult, EngineError> {
        stage(&run.staging_dir, source).await?;

        if let Some(compile_command) = &profile.compile_command {
            let spec = self.container_spec(run, profile, Step::Compile, compile_command);
            let outcome = self.launch(run, &spec, None).await?;
            if !outcome.succeeded() {
                debug!(run_id = %run.run_id, "Compile step failed");
                return Ok(ExecutionResult::compile_error(
                    compile_failure_message(&outcome),
                    run.started.elapsed(),
                ));
            }
        }

        let spec = self.container_spec(run, profile, Step::Run, &profile.run_command);
        let outcome = self.launch(run, &spec, stdin).await?;

        let oom_killed = if !outcome.timed_out && outcome.exit_code != Some(0) {
            self.runtime.oom_killed(&spec.name).await.unwrap_or_else(|e| {
                warn!(run_id = %run.run_id, "OOM inspection failed: {}", e);
                false
            })
        } else {
            false
        };

        if outcome.truncated {
            debug!(run_id = %run.run_id, "Output capped at {} bytes", self.max_output_bytes);
        }

        let raw = RawOutcome {
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            oom_killed,
            output: outcome.output,
        };
        Ok(assemble(raw, run.started.elapsed()))
    }

    /// Run one container, recording it for teardown before launch
    async fn launch(
        &self,
        run: &mut SandboxRun,
        spec: &ContainerSpec,
        stdin: Option<&str>,
    ) -> Result<ContainerOutcome, EngineError> {
        run.containers.push(LaunchedContainer {
            name: spec.name.clone(),
            finished: false,
        });

        let guard = spec.timeout + RUNTIME_GRACE;
        let outcome = match tokio::time::timeout(guard, self.runtime.run(spec, stdin)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    run_id = %run.run_id,
                    container = %spec.name,
                    "Runtime did not return within {:?}, treating as timeout",
                    guard
                );
                return Ok(ContainerOutcome {
                    timed_out: true,
                    ..Default::default()
                });
            }
        };

        if !outcome.timed_out {
            if let Some(container) = run.containers.last_mut() {
                container.finished = true;
            }
        }
        Ok(outcome)
    }

    fn container_spec(
        &self,
        run: &SandboxRun,
        profile: &LanguageProfile,
        step: Step,
        command: &[String],
    ) -> ContainerSpec {
        let limits = &profile.limits;
        let (memory_mb, pids, timeout) = match step {
            Step::Compile => (
                limits.compile_memory_mb,
                limits.compile_pids,
                limits.compile_timeout(),
            ),
            Step::Run => (limits.memory_mb, limits.pids, limits.run_timeout()),
        };

        ContainerSpec {
            name: run.container_name(step),
            image: profile.image.clone(),
            command: command.to_vec(),
            env: profile.env.clone(),
            workspace: run.staging_dir.clone(),
            workspace_writable: step == Step::Compile,
            memory_mb,
            cpus: limits.cpus,
            pids,
            tmpfs_mb: limits.tmpfs_mb,
            timeout,
            output_limit: self.max_output_bytes,
        }
    }
}

/// Create the run directory (exclusively) and write the source into it
async fn stage(dir: &Path, source: &NormalizedSource) -> Result<(), EngineError> {
    let staging_error = |source| EngineError::Staging {
        path: dir.to_path_buf(),
        source,
    };

    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).await.map_err(staging_error)?;
    }
    fs::create_dir(dir).await.map_err(staging_error)?;
    // The container user is unprivileged and the compile step writes here
    fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
        .await
        .map_err(staging_error)?;
    fs::write(dir.join(&source.filename), source.code.as_bytes())
        .await
        .map_err(staging_error)?;
    Ok(())
}

fn compile_failure_message(outcome: &ContainerOutcome) -> String {
    if outcome.timed_out {
        return "Compilation timed out".to_string();
    }
    if !outcome.output.trim().is_empty() {
        return outcome.output.clone();
    }
    match outcome.exit_code {
        Some(code) => format!("Compilation failed with exit code {}", code),
        None => "Compilation terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::{NormalizeRule, SandboxLimits};
    use crate::result::FailureKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    enum Behavior {
        Exit(i32, &'static str),
        Echo,
        Timeout,
        Hang,
        Fail,
    }

    struct FakeRuntime {
        behavior: fn(&ContainerSpec) -> Behavior,
        oom: bool,
        calls: Mutex<Vec<String>>,
        workspaces: Mutex<Vec<PathBuf>>,
    }

    impl FakeRuntime {
        fn new(behavior: fn(&ContainerSpec) -> Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                oom: false,
                calls: Mutex::new(Vec::new()),
                workspaces: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn run(&self, spec: &ContainerSpec, stdin: Option<&str>) -> Result<ContainerOutcome, EngineError> {
            let mode = if spec.workspace_writable { "rw" } else { "ro" };
            let step = spec.name.rsplit('-').next().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(format!("run:{}:{}", step, mode));
            self.workspaces.lock().unwrap().push(spec.workspace.clone());

            // The source must be staged before launch
            assert!(std::fs::read_dir(&spec.workspace).unwrap().count() >= 1);

            match (self.behavior)(spec) {
                Behavior::Exit(code, output) => Ok(ContainerOutcome {
                    exit_code: Some(code),
                    output: output.to_string(),
                    ..Default::default()
                }),
                Behavior::Echo => Ok(ContainerOutcome {
                    exit_code: Some(0),
                    output: stdin.unwrap_or("<closed>").to_string(),
                    ..Default::default()
                }),
                Behavior::Timeout => Ok(ContainerOutcome {
                    exit_code: None,
                    timed_out: true,
                    output: "partial".to_string(),
                    truncated: false,
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ContainerOutcome::default())
                }
                Behavior::Fail => Err(EngineError::Launch {
                    container: spec.name.clone(),
                    detail: "exit status 125".to_string(),
                }),
            }
        }

        async fn kill(&self, name: &str) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(format!("kill:{}", name));
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(format!("remove:{}", name));
            Ok(())
        }

        async fn oom_killed(&self, _name: &str) -> Result<bool, EngineError> {
            Ok(self.oom)
        }

        async fn version(&self) -> Result<String, EngineError> {
            Ok("fake-1.0".to_string())
        }

        async fn ensure_image(&self, _image: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn profile(compiled: bool) -> LanguageProfile {
        LanguageProfile {
            key: if compiled { "c" } else { "python" }.to_string(),
            image: "test:latest".to_string(),
            source_file: if compiled { "main.c" } else { "main.py" }.to_string(),
            compile_command: compiled.then(|| vec!["cc".to_string(), "main.c".to_string()]),
            run_command: vec!["./main".to_string()],
            env: Vec::new(),
            normalize: NormalizeRule::None,
            limits: SandboxLimits {
                timeout_ms: 50,
                compile_timeout_ms: 50,
                ..Default::default()
            },
        }
    }

    fn source(compiled: bool) -> NormalizedSource {
        NormalizedSource {
            filename: if compiled { "main.c" } else { "main.py" }.to_string(),
            code: "print(\"hi\")".to_string(),
        }
    }

    fn sandbox(runtime: Arc<FakeRuntime>) -> (ExecutionSandbox, TempDir) {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ExecutionSandbox::new(runtime, root.path(), 1024);
        (sandbox, root)
    }

    fn assert_no_leftovers(root: &TempDir) {
        let left: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert!(left.is_empty(), "staging leftovers: {:?}", left);
    }

    #[tokio::test]
    async fn test_successful_run_cleans_up() {
        let runtime = FakeRuntime::new(|_| Behavior::Exit(0, "hi\n"));
        let (sandbox, root) = sandbox(runtime.clone());

        let result = sandbox.run(&profile(false), &source(false), None).await.unwrap();
        assert_eq!(result.output, "hi\n");
        assert_eq!(result.failure, FailureKind::None);

        assert_eq!(runtime.count("run:run:ro"), 1);
        assert_eq!(runtime.count("remove:"), 1);
        assert_eq!(runtime.count("kill:"), 0);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_compile_then_run() {
        let runtime = FakeRuntime::new(|_| Behavior::Exit(0, "2\n"));
        let (sandbox, root) = sandbox(runtime.clone());

        let result = sandbox.run(&profile(true), &source(true), None).await.unwrap();
        assert_eq!(result.failure, FailureKind::None);

        let calls = runtime.calls();
        assert_eq!(calls[0], "run:compile:rw");
        assert_eq!(calls[1], "run:run:ro");
        assert_eq!(runtime.count("remove:"), 2);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_compile_failure_skips_run() {
        let runtime = FakeRuntime::new(|spec| {
            if spec.workspace_writable {
                Behavior::Exit(1, "main.c:1:1: error: expected ';'")
            } else {
                Behavior::Exit(0, "should not run")
            }
        });
        let (sandbox, root) = sandbox(runtime.clone());

        let result = sandbox.run(&profile(true), &source(true), None).await.unwrap();
        assert_eq!(result.failure, FailureKind::CompileError);
        assert!(result.is_error);
        assert!(result.output.contains("expected ';'"));
        assert_eq!(runtime.count("run:run"), 0);
        assert_eq!(runtime.count("remove:"), 1);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_silent_compile_failure_gets_message() {
        let runtime = FakeRuntime::new(|_| Behavior::Exit(1, ""));
        let (sandbox, _root) = sandbox(runtime);
        let result = sandbox.run(&profile(true), &source(true), None).await.unwrap();
        assert_eq!(result.output, "Compilation failed with exit code 1");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_classifies() {
        let runtime = FakeRuntime::new(|_| Behavior::Timeout);
        let (sandbox, root) = sandbox(runtime.clone());

        let result = sandbox.run(&profile(false), &source(false), None).await.unwrap();
        assert_eq!(result.failure, FailureKind::Timeout);
        assert!(result.output.starts_with("partial"));
        assert!(result.output.ends_with("Time limit exceeded"));

        let calls = runtime.calls();
        let kill = calls.iter().position(|c| c.starts_with("kill:")).unwrap();
        let remove = calls.iter().position(|c| c.starts_with("remove:")).unwrap();
        assert!(kill < remove);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_hung_runtime_is_cut_off() {
        let runtime = FakeRuntime::new(|_| Behavior::Hang);
        let (sandbox, root) = sandbox(runtime.clone());

        let started = Instant::now();
        let result = sandbox.run(&profile(false), &source(false), None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.failure, FailureKind::Timeout);
        assert_eq!(runtime.count("kill:"), 1);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_launch_failure_is_environment_fault() {
        let runtime = FakeRuntime::new(|_| Behavior::Fail);
        let (sandbox, root) = sandbox(runtime.clone());

        let err = sandbox
            .run(&profile(false), &source(false), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Launch { .. }));
        assert_eq!(runtime.count("remove:"), 1);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_staging_failure_launches_nothing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let runtime = FakeRuntime::new(|_| Behavior::Exit(0, ""));
        let sandbox = ExecutionSandbox::new(runtime.clone(), file.path(), 1024);

        let err = assert_err!(sandbox.run(&profile(false), &source(false), None).await);
        assert!(matches!(err, EngineError::Staging { .. }));
        assert_eq!(runtime.count("run:"), 0);
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let runtime = FakeRuntime::new(|_| Behavior::Echo);
        let (sandbox, _root) = sandbox(runtime);

        let with_input = sandbox
            .run(&profile(false), &source(false), Some("3 4\n"))
            .await
            .unwrap();
        assert_eq!(with_input.output, "3 4\n");

        let without = sandbox.run(&profile(false), &source(false), None).await.unwrap();
        assert_eq!(without.output, "<closed>");
    }

    #[tokio::test]
    async fn test_oom_is_runtime_error() {
        let runtime = Arc::new(FakeRuntime {
            behavior: |_| Behavior::Exit(137, ""),
            oom: true,
            calls: Mutex::new(Vec::new()),
            workspaces: Mutex::new(Vec::new()),
        });
        let (sandbox, _root) = sandbox(runtime);

        let result = sandbox.run(&profile(false), &source(false), None).await.unwrap();
        assert_eq!(result.failure, FailureKind::RuntimeError);
        assert_eq!(result.output, "Memory limit exceeded");
    }

    #[tokio::test]
    async fn test_concurrent_runs_never_share_a_directory() {
        let runtime = FakeRuntime::new(|_| Behavior::Exit(0, "ok"));
        let (sandbox, root) = sandbox(runtime.clone());
        let sandbox = Arc::new(sandbox);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sandbox = sandbox.clone();
                tokio::spawn(async move {
                    sandbox
                        .run(&profile(false), &source(false), None)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().failure, FailureKind::None);
        }

        let mut workspaces = runtime.workspaces.lock().unwrap().clone();
        workspaces.sort();
        workspaces.dedup();
        assert_eq!(workspaces.len(), 8);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_abandoned_run_is_cleaned_up() {
        let runtime = FakeRuntime::new(|_| Behavior::Hang);
        let (sandbox, root) = sandbox(runtime.clone());

        let cut = tokio::time::timeout(
            Duration::from_millis(300),
            sandbox.run(&profile(false), &source(false), None),
        )
        .await;
        assert!(cut.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runtime.count("kill:"), 1);
        assert_eq!(runtime.count("remove:"), 1);
        assert_no_leftovers(&root);
    }

    #[tokio::test]
    async fn test_runtime_probe() {
        let runtime = FakeRuntime::new(|_| Behavior::Exit(0, ""));
        let version = assert_ok!(ensure_runtime_available(runtime.as_ref()).await);
        assert_eq!(version, "fake-1.0");
    }
}
