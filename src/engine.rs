//! Execution engine
//!
//! The single operation callers use: resolve the language, run the gate,
//! normalize, execute in the sandbox. Shared state (registry, gate with its
//! ledger, sandbox) sits behind `Arc`s so a clone can go to every task.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::languages::LanguageRegistry;
use crate::normalizer::normalize;
use crate::result::ExecutionResult;
use crate::sandbox::ExecutionSandbox;
use crate::security::{GateDecision, SecurityGate, ACCESS_DENIED};

/// One submission
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Caller identity for violation tracking (usually the client IP)
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Clone)]
pub struct Engine {
    registry: Arc<LanguageRegistry>,
    gate: Arc<SecurityGate>,
    sandbox: Arc<ExecutionSandbox>,
}

impl Engine {
    pub fn new(registry: LanguageRegistry, gate: SecurityGate, sandbox: ExecutionSandbox) -> Self {
        Self {
            registry: Arc::new(registry),
            gate: Arc::new(gate),
            sandbox: Arc::new(sandbox),
        }
    }

    /// Caller-side safety timer for a request in `language`: the sandbox's
    /// own worst case plus `margin`. Unknown languages never reach the
    /// sandbox, so `margin` alone covers them.
    pub fn backstop(&self, language: &str, margin: Duration) -> Duration {
        match self.registry.resolve(language) {
            Some(profile) => profile
                .limits
                .backstop(profile.has_compile_step(), margin),
            None => margin,
        }
    }

    /// Execute one request.
    ///
    /// Rejections, compile errors, runtime errors and timeouts are all
    /// `Ok`. `Err` is reserved for environment faults; show callers
    /// `EngineError::public_message()` only.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        let Some(profile) = self.registry.resolve(&request.language) else {
            // Blocked callers get the same answer whatever they ask for
            if self.gate.is_blocked(request.identity.as_deref()) {
                warn!(language = %request.language, "Rejected blocked identity before language lookup");
                return Ok(ExecutionResult::rejected(ACCESS_DENIED));
            }
            warn!(language = %request.language, "Unsupported language requested");
            return Ok(ExecutionResult::rejected(format!(
                "Unsupported language: {}",
                request.language
            )));
        };

        let decision = self.gate.validate(
            &profile.key,
            &request.code,
            request.stdin.as_deref(),
            request.identity.as_deref(),
        );
        if let GateDecision::Reject(rejection) = decision {
            warn!(
                language = %profile.key,
                reason = %rejection.kind,
                identity = request.identity.as_deref().unwrap_or("-"),
                "Submission rejected by gate"
            );
            return Ok(ExecutionResult::rejected(rejection.message));
        }

        let source = normalize(&profile, &request.code);
        info!(
            language = %profile.key,
            file = %source.filename,
            bytes = source.code.len(),
            "Submission accepted"
        );

        self.sandbox
            .run(&profile, &source, request.stdin.as_deref())
            .await
    }
}
