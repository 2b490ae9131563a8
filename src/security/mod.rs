//! Static security gate
//!
//! Cheap pre-execution filter: size limits, blacklist lookup and
//! per-language forbidden-construct patterns. It exists to turn away
//! obviously hostile submissions and to leave an audit trail. Containment
//! is the sandbox's job; nothing here is an isolation guarantee.
//!
//! The gate does NOT:
//! - Run or rewrite code
//! - Know about containers or staging directories

pub mod ledger;
pub mod patterns;

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

pub use ledger::ViolationLedger;
pub use patterns::{PatternSet, SecurityConfig};

/// The only thing a blocked caller is ever told
pub const ACCESS_DENIED: &str = "Access denied";

/// Why a submission was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionKind {
    EmptyCode,
    CodeTooLarge,
    StdinTooLarge,
    Blocked,
    Forbidden { pattern: String },
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionKind::EmptyCode => "empty_code",
            RejectionKind::CodeTooLarge => "code_too_large",
            RejectionKind::StdinTooLarge => "stdin_too_large",
            RejectionKind::Blocked => "blocked",
            RejectionKind::Forbidden { .. } => "forbidden_pattern",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    /// User-facing message
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject(Rejection),
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept)
    }
}

pub struct SecurityGate {
    max_code_bytes: usize,
    max_stdin_bytes: usize,
    patterns: PatternSet,
    ledger: Arc<ViolationLedger>,
}

impl SecurityGate {
    /// Build a gate around an injected ledger
    pub fn new(config: SecurityConfig, ledger: Arc<ViolationLedger>) -> Self {
        Self {
            max_code_bytes: config.max_code_bytes,
            max_stdin_bytes: config.max_stdin_bytes,
            patterns: config.patterns,
            ledger,
        }
    }

    /// Build a gate and a fresh ledger configured from the same file
    pub fn from_config(config: SecurityConfig) -> Self {
        let ledger = Arc::new(ViolationLedger::new(
            config.violation_threshold,
            config.violation_window,
        ));
        Self::new(config, ledger)
    }

    pub fn ledger(&self) -> &Arc<ViolationLedger> {
        &self.ledger
    }

    pub fn is_blocked(&self, identity: Option<&str>) -> bool {
        identity.is_some_and(|id| self.ledger.is_blocked(id))
    }

    /// Decide whether a submission may proceed to execution.
    ///
    /// `language` is the canonical profile key. Checks run in a fixed order:
    /// code size, stdin size, blacklist, forbidden patterns. A pattern hit is
    /// reported to the ledger when the caller identity is known.
    pub fn validate(
        &self,
        language: &str,
        code: &str,
        stdin: Option<&str>,
        identity: Option<&str>,
    ) -> GateDecision {
        if code.trim().is_empty() {
            return reject(RejectionKind::EmptyCode, "Code is empty".to_string());
        }

        if code.len() > self.max_code_bytes {
            return reject(
                RejectionKind::CodeTooLarge,
                format!(
                    "Code exceeds maximum length of {} bytes",
                    self.max_code_bytes
                ),
            );
        }

        if stdin.map_or(0, str::len) > self.max_stdin_bytes {
            return reject(
                RejectionKind::StdinTooLarge,
                format!(
                    "Input exceeds maximum length of {} bytes",
                    self.max_stdin_bytes
                ),
            );
        }

        if let Some(identity) = identity.filter(|id| self.ledger.is_blocked(id)) {
            warn!(identity, language, "Rejected submission from blocked identity");
            return reject(RejectionKind::Blocked, ACCESS_DENIED.to_string());
        }

        if let Some(pattern) = self.patterns.find_match(language, code) {
            let violations = identity
                .map(|id| self.ledger.record_violation(id).count)
                .unwrap_or(0);

            warn!(
                language,
                pattern = %pattern.name,
                identity = identity.unwrap_or("-"),
                violations,
                code_sha256 = %source_digest(code),
                "Forbidden construct in submission"
            );

            return reject(
                RejectionKind::Forbidden {
                    pattern: pattern.name.clone(),
                },
                format!(
                    "Submission rejected: forbidden construct detected ({})",
                    pattern.name
                ),
            );
        }

        GateDecision::Accept
    }
}

fn reject(kind: RejectionKind, message: String) -> GateDecision {
    GateDecision::Reject(Rejection { kind, message })
}

/// Hex SHA-256 of the submitted source, logged instead of the source itself
pub fn source_digest(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SecurityGate {
        SecurityGate::from_config(SecurityConfig::load(None).unwrap())
    }

    fn kind(decision: GateDecision) -> RejectionKind {
        match decision {
            GateDecision::Reject(r) => r.kind,
            GateDecision::Accept => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_accepts_benign_code() {
        let gate = gate();
        assert!(gate
            .validate("python", "print(\"hi\")", None, Some("1.2.3.4"))
            .is_accept());
        assert_eq!(gate.ledger().violations("1.2.3.4"), 0);
    }

    #[test]
    fn test_size_limits() {
        let gate = gate();
        let at_limit = "a".repeat(65536);
        let over_limit = "a".repeat(65537);
        assert!(gate.validate("python", &at_limit, None, None).is_accept());
        assert_eq!(
            kind(gate.validate("python", &over_limit, None, None)),
            RejectionKind::CodeTooLarge
        );

        let big_stdin = "x".repeat(1024 * 1024 + 1);
        assert_eq!(
            kind(gate.validate("python", "print(1)", Some(&big_stdin), None)),
            RejectionKind::StdinTooLarge
        );
        assert_eq!(
            kind(gate.validate("python", "  \n", None, None)),
            RejectionKind::EmptyCode
        );
    }

    #[test]
    fn test_size_checked_before_patterns() {
        let gate = gate();
        let hostile = format!("import subprocess\n#{}", "a".repeat(70_000));
        assert_eq!(
            kind(gate.validate("python", &hostile, None, Some("9.9.9.9"))),
            RejectionKind::CodeTooLarge
        );
        assert_eq!(gate.ledger().violations("9.9.9.9"), 0);
    }

    #[test]
    fn test_repeat_offender_is_blocked_even_for_benign_code() {
        let gate = gate();
        let ip = Some("10.1.1.1");
        for _ in 0..3 {
            let decision = gate.validate("python", "import os\nos.system('id')", None, ip);
            assert!(matches!(
                kind(decision),
                RejectionKind::Forbidden { ref pattern } if pattern == "process-spawn"
            ));
        }

        match gate.validate("python", "print(\"hi\")", None, ip) {
            GateDecision::Reject(r) => {
                assert_eq!(r.kind, RejectionKind::Blocked);
                assert_eq!(r.message, "Access denied");
            }
            GateDecision::Accept => panic!("blocked identity was accepted"),
        }

        // Other callers are unaffected
        assert!(gate
            .validate("python", "print(\"hi\")", None, Some("10.1.1.2"))
            .is_accept());

        gate.ledger().reset("10.1.1.1");
        assert!(gate.validate("python", "print(\"hi\")", None, ip).is_accept());
    }

    #[test]
    fn test_anonymous_violation_not_counted() {
        let gate = gate();
        let decision = gate.validate("ruby", "puts `id`", None, None);
        assert!(matches!(kind(decision), RejectionKind::Forbidden { .. }));
    }

    #[test]
    fn test_shared_ledger() {
        let config = SecurityConfig::load(None).unwrap();
        let ledger = Arc::new(ViolationLedger::new(1, None));
        let a = SecurityGate::new(config.clone(), ledger.clone());
        let b = SecurityGate::new(config, ledger);

        a.validate("go", "import \"os/exec\"", None, Some("x"));
        assert_eq!(
            kind(b.validate("go", "package main", None, Some("x"))),
            RejectionKind::Blocked
        );
    }

    #[test]
    fn test_source_digest() {
        assert_eq!(
            source_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
