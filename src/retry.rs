//! Retry policy and transient-failure classification.
//!
//! The policy is plain configuration: attempt limit, backoff strategy, and
//! the set of error signatures considered transient. The classifier only
//! compiles those signatures and answers "retry or not" for a failed
//! invocation; it holds no engine logic of its own.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::runner::InvocationResult;

/// Default number of total attempts per test case.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts.
pub const DEFAULT_DELAY_MS: u64 = 5_000;

/// Default ceiling for exponential backoff.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Transient signatures of provisioning tools, as (regex, description).
const DEFAULT_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    (
        r".*read: connection reset by peer.*",
        "Failed to reach a remote endpoint",
    ),
    (r".*transport is closing.*", "Failed to reach Kubernetes API"),
    (r".*TLS handshake timeout.*", "TLS handshake timed out"),
    (
        r".*unable to verify signature.*",
        "Failed to retrieve plugin due to transient network error",
    ),
    (
        r".*unable to verify checksum.*",
        "Failed to retrieve plugin due to transient network error",
    ),
    (
        r".*registry service is unreachable.*",
        "Failed to retrieve plugin due to transient network error",
    ),
    (
        r".*Error installing provider.*",
        "Failed to install provider due to transient network error",
    ),
    (
        r".*Failed to query available provider packages.*",
        "Failed to retrieve plugin due to transient network error",
    ),
    (
        r".*timeout while waiting for plugin to start.*",
        "Failed to start plugin",
    ),
    (
        r".*timed out waiting for server handshake.*",
        "Provider handshake timed out",
    ),
    (
        r"could not query provider registry for",
        "Failed to query provider registry",
    ),
    (
        r".*Could not retrieve the list of available versions for provider.*",
        "Failed to retrieve provider versions",
    ),
    (r".*Could not download module.*", "Failed to download module"),
    (r".*429 Too Many Requests.*", "Rate limited"),
    (r"(?i).*rate exceeded.*", "Rate limited"),
    (
        r".*Error acquiring the state lock.*",
        "State backend lock is held by another process",
    ),
];

/// How a retryable signature is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Substring,
    #[default]
    Regex,
}

/// One configured transient-failure signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(default)]
    pub kind: MatchKind,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PatternSpec {
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            kind: MatchKind::Regex,
            pattern: pattern.into(),
            description: None,
        }
    }

    pub fn substring(pattern: impl Into<String>) -> Self {
        Self {
            kind: MatchKind::Substring,
            pattern: pattern.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The shipped transient-failure signatures.
pub fn default_retryable_errors() -> Vec<PatternSpec> {
    DEFAULT_RETRYABLE_ERRORS
        .iter()
        .map(|(pattern, description)| PatternSpec::regex(*pattern).with_description(*description))
        .collect()
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay.
    Fixed { delay_ms: u64 },
    /// Doubles per retry, capped at `max_delay_ms`.
    Exponential {
        initial_delay_ms: u64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed {
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl BackoffStrategy {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
            } => {
                let shift = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                let delay = initial_delay_ms.saturating_mul(factor).min(max_delay_ms);
                Duration::from_millis(delay)
            }
        }
    }
}

/// Attempt limit, backoff, and transient signatures for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<PatternSpec>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffStrategy::default(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check the policy without compiling patterns.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HarnessError::config("retry.max_attempts must be at least 1"));
        }

        if let BackoffStrategy::Exponential {
            initial_delay_ms,
            max_delay_ms,
        } = self.backoff
        {
            if max_delay_ms < initial_delay_ms {
                return Err(HarnessError::config(format!(
                    "retry.backoff.max_delay_ms ({}) is below initial_delay_ms ({})",
                    max_delay_ms, initial_delay_ms
                )));
            }
        }

        for spec in &self.retryable_errors {
            if spec.pattern.is_empty() {
                return Err(HarnessError::config("retryable error pattern is empty"));
            }
        }

        Ok(())
    }
}

/// Verdict on a failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Matched a transient signature.
    Retryable { description: String },
    Fatal,
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::Retryable { .. })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Substring(String),
    Regex(Regex),
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Substring(needle) => text.contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

/// Compiled set of transient-failure signatures.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    matchers: Vec<(Matcher, String)>,
}

impl RetryClassifier {
    /// Compile `patterns`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a regex that does not compile.
    pub fn new(patterns: &[PatternSpec]) -> Result<Self> {
        let matchers = patterns
            .iter()
            .map(|spec| {
                let matcher = match spec.kind {
                    MatchKind::Substring => Matcher::Substring(spec.pattern.clone()),
                    MatchKind::Regex => Matcher::Regex(Regex::new(&spec.pattern).map_err(|e| {
                        HarnessError::config(format!(
                            "invalid retryable error pattern '{}': {}",
                            spec.pattern, e
                        ))
                    })?),
                };
                let description = spec
                    .description
                    .clone()
                    .unwrap_or_else(|| spec.pattern.clone());
                Ok((matcher, description))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { matchers })
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Classify a finished invocation. Successful invocations are not
    /// classified and yield `None`.
    pub fn classify(&self, result: &InvocationResult) -> Option<Classification> {
        if result.success() {
            return None;
        }
        Some(self.classify_text(&result.error_text()))
    }

    /// Classify raw error text.
    pub fn classify_text(&self, text: &str) -> Classification {
        self.matchers
            .iter()
            .find(|(matcher, _)| matcher.is_match(text))
            .map(|(_, description)| Classification::Retryable {
                description: description.clone(),
            })
            .unwrap_or(Classification::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> InvocationResult {
        InvocationResult {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_default_patterns_compile() {
        let classifier = RetryClassifier::new(&default_retryable_errors()).unwrap();
        assert_eq!(classifier.len(), DEFAULT_RETRYABLE_ERRORS.len());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let classifier = RetryClassifier::new(&RetryPolicy::default().retryable_errors).unwrap();

        for text in [
            "Error: Failed to query available provider packages\n\nCould not retrieve...",
            "Get \"https://registry.terraform.io/\": net/http: TLS handshake timeout",
            "Error: Error acquiring the state lock",
            "googleapi: Error 429: Rate Exceeded",
            "read tcp 10.0.0.1:443: read: connection reset by peer",
        ] {
            assert!(
                classifier.classify(&failed(text)).unwrap().is_retryable(),
                "{:?} should be retryable",
                text
            );
        }
    }

    #[test]
    fn test_unmatched_error_is_fatal() {
        let classifier = RetryClassifier::new(&default_retryable_errors()).unwrap();
        let result = failed("Error: Reference to undeclared input variable \"replicas\"");
        assert_eq!(classifier.classify(&result), Some(Classification::Fatal));
    }

    #[test]
    fn test_success_is_never_classified() {
        let classifier = RetryClassifier::new(&[PatternSpec::substring("")]).unwrap();
        let ok = InvocationResult {
            exit_code: Some(0),
            stdout: "No changes.".into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        };
        assert_eq!(classifier.classify(&ok), None);
    }

    #[test]
    fn test_stdout_is_inspected_too() {
        let classifier = RetryClassifier::new(&[PatternSpec::substring("Could not download module")]).unwrap();
        let result = InvocationResult {
            exit_code: Some(1),
            stdout: "Could not download module \"vpc\"".into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        };
        assert!(classifier.classify(&result).unwrap().is_retryable());
    }

    #[test]
    fn test_signal_termination_is_classified() {
        let classifier = RetryClassifier::new(&[PatternSpec::substring("flaky")]).unwrap();
        let result = InvocationResult {
            exit_code: None,
            stdout: String::new(),
            stderr: "flaky network".into(),
            duration: Duration::ZERO,
        };
        assert!(classifier.classify(&result).unwrap().is_retryable());
    }

    #[test]
    fn test_outcome_is_order_independent() {
        let a = PatternSpec::substring("rate").with_description("a");
        let b = PatternSpec::regex("lock").with_description("b");
        let forward = RetryClassifier::new(&[a.clone(), b.clone()]).unwrap();
        let reverse = RetryClassifier::new(&[b, a]).unwrap();

        for text in ["rate limit", "state lock", "rate + lock", "syntax error"] {
            assert_eq!(
                forward.classify_text(text).is_retryable(),
                reverse.classify_text(text).is_retryable()
            );
        }
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let err = RetryClassifier::new(&[PatternSpec::regex("(unclosed")]).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = BackoffStrategy::Fixed { delay_ms: 250 };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_after(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_doubles_up_to_ceiling() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_after(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_after(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());

        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());

        let inverted = RetryPolicy {
            backoff: BackoffStrategy::Exponential {
                initial_delay_ms: 500,
                max_delay_ms: 100,
            },
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{ "max_attempts": 5, "backoff": { "strategy": "exponential", "initial_delay_ms": 10 } }"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(
            policy.backoff,
            BackoffStrategy::Exponential {
                initial_delay_ms: 10,
                max_delay_ms: DEFAULT_MAX_DELAY_MS
            }
        );
        assert_eq!(policy.retryable_errors, default_retryable_errors());
    }
}
