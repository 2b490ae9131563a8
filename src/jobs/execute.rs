//! Execute job: one submission in, one reply out

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::engine::{Engine, ExecutionRequest};
use crate::error::SYSTEM_UNAVAILABLE;
use crate::result::{ExecutionResult, FailureKind};

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub request_id: String,
    /// List the reply is pushed to (the caller BLPOPs it)
    pub result_key: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Used as the violation-ledger identity
    #[serde(default)]
    pub client_ip: Option<String>,
}

impl ExecuteJob {
    pub fn to_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            language: self.language.clone(),
            code: self.code.clone(),
            stdin: self.stdin.clone(),
            identity: self.client_ip.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecuteReply {
    pub request_id: String,
    pub output: String,
    pub is_error: bool,
    pub duration_seconds: f64,
    /// None when the environment failed rather than the user code
    pub failure: Option<FailureKind>,
}

impl ExecuteReply {
    pub fn from_result(request_id: &str, result: ExecutionResult) -> Self {
        Self {
            request_id: request_id.to_string(),
            output: result.output,
            is_error: result.is_error,
            duration_seconds: result.duration_seconds,
            failure: Some(result.failure),
        }
    }

    pub fn unavailable(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            output: SYSTEM_UNAVAILABLE.to_string(),
            is_error: true,
            duration_seconds: 0.0,
            failure: None,
        }
    }
}

/// Run the job under the caller-side backstop timer. Never fails: faults
/// and backstop expiry become the generic unavailable reply.
pub async fn process_execute_job(engine: &Engine, job: &ExecuteJob, margin: Duration) -> ExecuteReply {
    let backstop = engine.backstop(&job.language, margin);
    let request = job.to_request();

    match tokio::time::timeout(backstop, engine.execute(&request)).await {
        Ok(Ok(result)) => ExecuteReply::from_result(&job.request_id, result),
        Ok(Err(e)) => {
            error!(request_id = %job.request_id, "Execution failed: {:#}", e);
            ExecuteReply {
                output: e.public_message().to_string(),
                ..ExecuteReply::unavailable(&job.request_id)
            }
        }
        Err(_) => {
            error!(
                request_id = %job.request_id,
                "Backstop timer fired after {:?}; sandbox limit did not",
                backstop
            );
            ExecuteReply::unavailable(&job.request_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::languages::LanguageRegistry;
    use crate::sandbox::{ContainerOutcome, ContainerRuntime, ContainerSpec, ExecutionSandbox};
    use crate::security::{SecurityConfig, SecurityGate};
    use async_trait::async_trait;
    use std::sync::Arc;

    const FAST_PYTHON: &str = r#"
[python]
image = "python:3.12-alpine"
source_file = "main.py"
run_command = "python3 main.py"

[python.limits]
timeout_ms = 50
"#;

    enum Mode {
        Ok,
        Fault,
        Hang,
    }

    struct ScriptedRuntime(Mode);

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn run(&self, spec: &ContainerSpec, _stdin: Option<&str>) -> Result<ContainerOutcome, EngineError> {
            match self.0 {
                Mode::Ok => Ok(ContainerOutcome {
                    exit_code: Some(0),
                    output: "hi\n".to_string(),
                    ..Default::default()
                }),
                Mode::Fault => Err(EngineError::RuntimeUnavailable(format!(
                    "daemon gone while starting {}",
                    spec.name
                ))),
                Mode::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ContainerOutcome::default())
                }
            }
        }
        async fn kill(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn remove(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn oom_killed(&self, _name: &str) -> Result<bool, EngineError> {
            Ok(false)
        }
        async fn version(&self) -> Result<String, EngineError> {
            Ok("scripted".to_string())
        }
        async fn ensure_image(&self, _image: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn engine(mode: Mode, root: &std::path::Path) -> Engine {
        Engine::new(
            LanguageRegistry::from_toml_str(FAST_PYTHON).unwrap(),
            SecurityGate::from_config(SecurityConfig::load(None).unwrap()),
            ExecutionSandbox::new(Arc::new(ScriptedRuntime(mode)), root, 1024),
        )
    }

    fn job() -> ExecuteJob {
        serde_json::from_str(
            r#"{"request_id":"r-1","result_key":"executor:result:r-1","language":"python","code":"print(\"hi\")"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_job_optional_fields() {
        let job = job();
        assert!(job.stdin.is_none());
        assert!(job.client_ip.is_none());
        assert_eq!(job.to_request().language, "python");
    }

    #[tokio::test]
    async fn test_successful_reply() {
        let root = tempfile::tempdir().unwrap();
        let reply = process_execute_job(&engine(Mode::Ok, root.path()), &job(), Duration::from_secs(1)).await;
        assert_eq!(reply.output, "hi\n");
        assert!(!reply.is_error);
        assert_eq!(reply.failure, Some(FailureKind::None));

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["request_id"], "r-1");
        assert_eq!(json["failure"], "none");
    }

    #[tokio::test]
    async fn test_fault_hides_detail() {
        let root = tempfile::tempdir().unwrap();
        let reply =
            process_execute_job(&engine(Mode::Fault, root.path()), &job(), Duration::from_secs(1)).await;
        assert_eq!(reply, ExecuteReply::unavailable("r-1"));
        assert!(!reply.output.contains("daemon"));
    }

    #[tokio::test]
    async fn test_backstop_fires_and_run_is_cleaned() {
        let root = tempfile::tempdir().unwrap();
        let reply =
            process_execute_job(&engine(Mode::Hang, root.path()), &job(), Duration::from_millis(200)).await;
        assert_eq!(reply.output, SYSTEM_UNAVAILABLE);
        assert!(reply.failure.is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
