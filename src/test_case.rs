//! Module test cases: what an operator or CI pipeline declares and runs.
//!
//! A test case bundles a module location, its complete variable set, the
//! backend to validate it with, and what the run is expected to produce.
//! The engine turns it into a [`Report`]; [`ModuleTestCase::verdict`]
//! compares that report against the expectation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::backend::BackendSelector;
use crate::engine::{Outcome, Report};
use crate::variables::{VarValue, VariableSet};

/// What a test case expects from its run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Expectation {
    /// The module plans/validates cleanly.
    #[default]
    Success,
    /// The run fails, and the failure text contains `signature`.
    Failure { signature: String },
}

/// Final judgement on one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Skip,
    Fail(String),
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Fail(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Skip => write!(f, "SKIP"),
            Verdict::Fail(reason) => write!(f, "FAIL: {}", reason),
        }
    }
}

/// One module validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleTestCase {
    pub name: String,
    /// Directory holding the module's definitions.
    pub module: PathBuf,
    #[serde(default)]
    pub backend: BackendSelector,
    /// Complete variable set; the harness does not check required keys.
    #[serde(default)]
    pub variables: VariableSet,
    /// Extra environment for every command of the run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub expect: Expectation,
}

impl ModuleTestCase {
    /// Direct-backend case with no variables.
    pub fn new(name: impl Into<String>, module: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            backend: BackendSelector::default(),
            variables: VariableSet::new(),
            env: BTreeMap::new(),
            expect: Expectation::Success,
        }
    }

    pub fn with_backend(mut self, backend: BackendSelector) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_variables(mut self, variables: VariableSet) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn expecting(mut self, expect: Expectation) -> Self {
        self.expect = expect;
        self
    }

    /// Look up one declared variable.
    pub fn variable(&self, key: &str) -> Option<&VarValue> {
        self.variables.get(key)
    }

    /// Resolve relative paths against `base` (the suite file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.module.is_relative() {
            self.module = base.join(&self.module);
        }
        self.backend.resolve_paths(base);
    }

    /// Directory the provisioning tool will run in.
    pub fn working_dir(&self) -> PathBuf {
        match &self.backend {
            BackendSelector::Orchestrated { config_dir, .. } => config_dir.clone(),
            BackendSelector::Direct { .. } => self.module.clone(),
        }
    }

    /// Compare a run's report against the expectation.
    pub fn verdict(&self, report: &Report) -> Verdict {
        match (&report.outcome, &self.expect) {
            (Outcome::Skipped { .. }, _) => Verdict::Skip,
            (Outcome::Cancelled, _) => Verdict::Fail("run was cancelled".to_string()),
            (Outcome::Passed, Expectation::Success) => Verdict::Pass,
            (Outcome::Passed, Expectation::Failure { signature }) => Verdict::Fail(format!(
                "expected failure matching '{}', but the run passed",
                signature
            )),
            (outcome, Expectation::Success) => Verdict::Fail(outcome.to_string()),
            (outcome, Expectation::Failure { signature }) => {
                let matched = outcome.reason().is_some_and(|r| r.contains(signature.as_str()))
                    || report.last_stderr.contains(signature.as_str())
                    || report.last_stdout.contains(signature.as_str());
                if matched {
                    Verdict::Pass
                } else {
                    Verdict::Fail(format!(
                        "failure did not match '{}': {}",
                        signature, outcome
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureKind;

    fn report(outcome: Outcome, stderr: &str) -> Report {
        let mut report = Report::for_case(&ModuleTestCase::new("t", "m"));
        report.outcome = outcome;
        report.last_stderr = stderr.to_string();
        report
    }

    #[test]
    fn test_success_expectation() {
        let case = ModuleTestCase::new("vault", "modules/vault");
        assert_eq!(case.verdict(&report(Outcome::Passed, "")), Verdict::Pass);
        assert!(
            case.verdict(&report(
                Outcome::FailedFatal {
                    kind: FailureKind::FatalExecution,
                    reason: "exit code 1: Error: bad".into()
                },
                ""
            ))
            .is_failure()
        );
    }

    #[test]
    fn test_skip_and_cancel() {
        let case = ModuleTestCase::new("vault", "modules/vault");
        assert_eq!(
            case.verdict(&report(Outcome::Skipped { reason: "gate".into() }, "")),
            Verdict::Skip
        );
        assert!(case.verdict(&report(Outcome::Cancelled, "")).is_failure());
    }

    #[test]
    fn test_failure_expectation_matches_signature() {
        let case = ModuleTestCase::new("auth", "modules/auth").expecting(Expectation::Failure {
            signature: "oidc_client_secret".into(),
        });

        let matching = report(
            Outcome::FailedFatal {
                kind: FailureKind::FatalExecution,
                reason: "exit code 1: Error: No value for required variable".into(),
            },
            "Error: No value for required variable\n  variable \"oidc_client_secret\"",
        );
        assert_eq!(case.verdict(&matching), Verdict::Pass);

        let other = report(
            Outcome::FailedExhaustedRetries {
                last_reason: "exit code 1: TLS handshake timeout".into(),
            },
            "",
        );
        assert!(case.verdict(&other).is_failure());

        assert!(case.verdict(&report(Outcome::Passed, "")).is_failure());
    }

    #[test]
    fn test_deserialize_declaration() {
        let case: ModuleTestCase = serde_json::from_str(
            r#"{
                "name": "vault-basic",
                "module": "terraform/modules/vault",
                "variables": { "name": "vault-test", "ha_enabled": false, "replica_count": 1 }
            }"#,
        )
        .unwrap();

        assert_eq!(case.backend, BackendSelector::direct());
        assert_eq!(case.expect, Expectation::Success);
        assert_eq!(case.variable("replica_count"), Some(&VarValue::Int(1)));
    }

    #[test]
    fn test_working_dir_follows_backend() {
        let mut case = ModuleTestCase::new("vault", "terraform/modules/vault")
            .with_backend(BackendSelector::orchestrated("terragrunt/modules/vault"));
        case.resolve_paths(Path::new("/repo"));

        assert_eq!(case.module, PathBuf::from("/repo/terraform/modules/vault"));
        assert_eq!(case.working_dir(), PathBuf::from("/repo/terragrunt/modules/vault"));
    }
}
