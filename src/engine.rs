//! Execution Engine
//!
//! Drives one module test case through an explicit state machine and
//! resolves every failure into exactly one [`Outcome`].
//!
//! # State Flow
//!
//! ```text
//! Idle ──────────────► FailedFatal        (variables cannot be marshaled)
//!   │  └─────────────► Cancelled          (cancelled before the first spawn)
//!   │
//!   ▼
//! Invoking ──────────► Succeeded          (exit code 0, never classified)
//!   │  │  └──────────► FailedFatal        (launch failure, timeout)
//!   │  └─────────────► Cancelled
//!   ▼
//! Classifying ───────► FailedFatal        (no transient signature matched)
//!   │  └─────────────► FailedExhausted    (transient, attempts used up)
//!   ▼
//! Retrying ──(backoff)──► Invoking
//!   └────────────────► Cancelled
//! ```
//!
//! The orchestration skip gate sits in front of the machine: a gated case
//! never leaves `Idle` and reports `Skipped`.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use strum::Display;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind};
use crate::error::{HarnessError, Result};
use crate::retry::{Classification, RetryClassifier, RetryPolicy};
use crate::runner::{CancelToken, InvocationResult, ProcessRunner, RunControl, SystemRunner};
use crate::test_case::ModuleTestCase;

/// Environment variable that enables orchestrated test cases.
pub const DEFAULT_ORCHESTRATION_ENV: &str = "CI_WITH_TERRAGRUNT";

/// States of one test case run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Invoking,
    Classifying,
    Retrying,
    Succeeded,
    FailedFatal,
    FailedExhausted,
    Cancelled,
}

impl EngineState {
    /// Returns true for states that end the run
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedFatal | Self::FailedExhausted | Self::Cancelled
        )
    }

    /// Returns true if `next` is a legal successor of this state
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Invoking)
                | (Self::Idle, Self::FailedFatal)
                | (Self::Idle, Self::Cancelled)
                | (Self::Invoking, Self::Succeeded)
                | (Self::Invoking, Self::Classifying)
                | (Self::Invoking, Self::FailedFatal)
                | (Self::Invoking, Self::Cancelled)
                | (Self::Classifying, Self::Retrying)
                | (Self::Classifying, Self::FailedFatal)
                | (Self::Classifying, Self::FailedExhausted)
                | (Self::Retrying, Self::Invoking)
                | (Self::Retrying, Self::Cancelled)
        )
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Attempted to leave a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: EngineState },

    /// Edge not in the state machine
    #[error("Illegal transition from {from} to {to}")]
    Illegal { from: EngineState, to: EngineState },
}

/// Owns the current state of one run and its history.
#[derive(Debug, Clone)]
pub struct RunContext {
    current: EngineState,
    history: Vec<EngineState>,
    attempt: u32,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            current: EngineState::Idle,
            history: vec![EngineState::Idle],
            attempt: 0,
        }
    }

    #[inline]
    pub fn current(&self) -> EngineState {
        self.current
    }

    /// Number of times `Invoking` has been entered
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Every state visited, starting with `Idle`
    pub fn history(&self) -> &[EngineState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if the run already ended
    /// - `Illegal` if `next` is not a successor of the current state
    pub fn transition_to(&mut self, next: EngineState) -> std::result::Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        if !self.current.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.current,
                to: next,
            });
        }

        if next == EngineState::Invoking {
            self.attempt += 1;
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

/// Why a run failed fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A variable had no argument form
    Marshal,
    /// The tool could not be started
    Launch,
    /// The tool failed with no transient signature
    FatalExecution,
    /// The tool kept failing transiently
    TransientExecution,
    /// The tool exceeded the per-attempt time limit
    Timeout,
    /// Engine bug
    Internal,
}

/// Terminal result of a test case. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Skipped { reason: String },
    FailedFatal { kind: FailureKind, reason: String },
    FailedExhaustedRetries { last_reason: String },
    Cancelled,
}

impl Outcome {
    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Outcome::FailedFatal {
            kind,
            reason: reason.into(),
        }
    }

    /// Passed or Skipped: nothing for a test runner to report.
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Passed | Outcome::Skipped { .. })
    }

    /// Failure kind, if the run failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::FailedFatal { kind, .. } => Some(*kind),
            Outcome::FailedExhaustedRetries { .. } => Some(FailureKind::TransientExecution),
            _ => None,
        }
    }

    /// Reason text of skips and failures.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Skipped { reason } | Outcome::FailedFatal { reason, .. } => Some(reason),
            Outcome::FailedExhaustedRetries { last_reason } => Some(last_reason),
            Outcome::Passed | Outcome::Cancelled => None,
        }
    }

    /// Fold an engine error into an outcome.
    fn from_error(err: &HarnessError) -> Self {
        let kind = match err {
            HarnessError::Cancelled => return Outcome::Cancelled,
            HarnessError::Marshal(_) => FailureKind::Marshal,
            HarnessError::Launch { .. } => FailureKind::Launch,
            HarnessError::TimedOut { .. } => FailureKind::Timeout,
            _ => FailureKind::Internal,
        };
        Outcome::failed(kind, err.to_string())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Skipped { reason } => write!(f, "skipped ({})", reason),
            Outcome::FailedFatal { kind, reason } => write!(f, "failed [{}]: {}", kind, reason),
            Outcome::FailedExhaustedRetries { last_reason } => {
                write!(f, "failed after exhausting retries: {}", last_reason)
            }
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a test case plus the diagnostics a runner shows.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub name: String,
    pub backend: BackendKind,
    pub working_dir: PathBuf,
    pub outcome: Outcome,
    /// Invocation attempts made.
    pub attempts: u32,
    /// Backoff actually slept between attempts.
    pub backoff_ms: u64,
    pub elapsed_ms: u64,
    pub last_exit_code: Option<i32>,
    pub last_stdout: String,
    pub last_stderr: String,
    pub states: Vec<EngineState>,
}

impl Report {
    /// Empty report for `case`; the engine fills it in.
    pub fn for_case(case: &ModuleTestCase) -> Self {
        Self {
            name: case.name.clone(),
            backend: case.backend.kind(),
            working_dir: case.working_dir(),
            outcome: Outcome::Cancelled,
            attempts: 0,
            backoff_ms: 0,
            elapsed_ms: 0,
            last_exit_code: None,
            last_stdout: String::new(),
            last_stderr: String::new(),
            states: Vec::new(),
        }
    }

    pub fn total_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn record(&mut self, result: &InvocationResult) {
        self.last_exit_code = result.exit_code;
        self.last_stdout = result.stdout.clone();
        self.last_stderr = result.stderr.clone();
    }
}

/// Engine-wide settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: RetryPolicy,
    /// Whether orchestrated cases may run in this environment.
    pub orchestration_enabled: bool,
    /// Kill an attempt that runs longer than this.
    pub attempt_timeout: Option<Duration>,
    /// Pass `-no-color` to the direct backend.
    pub no_color: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            orchestration_enabled: false,
            attempt_timeout: None,
            no_color: true,
        }
    }
}

impl EngineConfig {
    /// Read the orchestration gate: enabled only when `var` is exactly `"true"`.
    pub fn orchestration_gate_from_env(var: &str) -> bool {
        std::env::var(var).map(|v| v == "true").unwrap_or(false)
    }
}

/// Runs module test cases.
#[derive(Debug)]
pub struct ExecutionEngine<R = SystemRunner> {
    runner: R,
    config: EngineConfig,
    classifier: RetryClassifier,
}

impl ExecutionEngine<SystemRunner> {
    /// Engine spawning real processes.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_runner(config, SystemRunner::new())
    }
}

impl<R: ProcessRunner> ExecutionEngine<R> {
    /// Engine using `runner` to execute commands.
    ///
    /// # Errors
    ///
    /// Configuration errors from the retry policy or its patterns.
    pub fn with_runner(config: EngineConfig, runner: R) -> Result<Self> {
        config.policy.validate()?;
        let classifier = RetryClassifier::new(&config.policy.retryable_errors)?;
        Ok(Self {
            runner,
            config,
            classifier,
        })
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run `case` to its single outcome. Never fails: every error is
    /// folded into the report.
    pub fn run(&self, case: &ModuleTestCase, cancel: &CancelToken) -> Report {
        let start = Instant::now();
        let mut report = Report::for_case(case);
        let backend = case
            .backend
            .build(self.config.no_color)
            .with_env(case.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        if backend.kind() == BackendKind::Orchestrated && !self.config.orchestration_enabled {
            info!(test = %case.name, "orchestration wrapper not enabled, skipping");
            report.outcome = Outcome::Skipped {
                reason: "orchestration wrapper not enabled in this environment".to_string(),
            };
            report.states = vec![EngineState::Idle];
            return report;
        }

        let mut ctx = RunContext::new();
        let outcome = match self.drive(case, &backend, &mut ctx, &mut report, cancel) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(test = %case.name, error = %err, "engine error");
                Outcome::from_error(&err)
            }
        };

        report.attempts = ctx.attempt();
        report.states = ctx.history().to_vec();
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            Outcome::Passed => info!(test = %case.name, attempts = report.attempts, "passed"),
            other => warn!(test = %case.name, attempts = report.attempts, outcome = %other, "did not pass"),
        }
        report.outcome = outcome;
        report
    }

    fn drive(
        &self,
        case: &ModuleTestCase,
        backend: &Backend,
        ctx: &mut RunContext,
        report: &mut Report,
        cancel: &CancelToken,
    ) -> Result<Outcome> {
        if let Err(err) = backend.commands(&case.module, &case.variables) {
            ctx.transition_to(EngineState::FailedFatal)?;
            return Ok(Outcome::failed(FailureKind::Marshal, err.to_string()));
        }

        if cancel.is_cancelled() {
            ctx.transition_to(EngineState::Cancelled)?;
            return Ok(Outcome::Cancelled);
        }

        let policy = &self.config.policy;
        let control = RunControl {
            cancel: cancel.clone(),
            timeout: self.config.attempt_timeout,
            deadline: None,
        };

        loop {
            ctx.transition_to(EngineState::Invoking)?;
            let attempt = ctx.attempt();
            info!(
                test = %case.name,
                backend = %backend,
                attempt,
                max_attempts = policy.max_attempts,
                "invoking"
            );

            let result = match backend.invoke(&self.runner, &case.module, &case.variables, &control) {
                Ok(result) => result,
                Err(HarnessError::Cancelled) => {
                    ctx.transition_to(EngineState::Cancelled)?;
                    return Ok(Outcome::Cancelled);
                }
                Err(err @ HarnessError::Transition(_)) => return Err(err),
                Err(err) => {
                    ctx.transition_to(EngineState::FailedFatal)?;
                    return Ok(Outcome::from_error(&err));
                }
            };
            report.record(&result);

            if result.success() {
                ctx.transition_to(EngineState::Succeeded)?;
                return Ok(Outcome::Passed);
            }

            ctx.transition_to(EngineState::Classifying)?;
            let reason = result.failure_summary();

            match self.classifier.classify(&result) {
                Some(Classification::Retryable { description }) if attempt < policy.max_attempts => {
                    ctx.transition_to(EngineState::Retrying)?;
                    let delay = policy.backoff.delay_after(attempt);
                    warn!(
                        test = %case.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %description,
                        "transient failure, retrying"
                    );
                    if !cancel.sleep(delay) {
                        ctx.transition_to(EngineState::Cancelled)?;
                        return Ok(Outcome::Cancelled);
                    }
                    report.backoff_ms += delay.as_millis() as u64;
                }
                Some(Classification::Retryable { description }) => {
                    ctx.transition_to(EngineState::FailedExhausted)?;
                    return Ok(Outcome::FailedExhaustedRetries {
                        last_reason: format!("{} ({})", reason, description),
                    });
                }
                Some(Classification::Fatal) | None => {
                    ctx.transition_to(EngineState::FailedFatal)?;
                    return Ok(Outcome::failed(FailureKind::FatalExecution, reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSelector;
    use crate::retry::{BackoffStrategy, PatternSpec};
    use crate::runner::CommandSpec;
    use crate::variables::{VarValue, VariableSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted (exit code, stderr) pairs and counts spawns.
    struct Scripted {
        script: Mutex<Vec<(i32, &'static str)>>,
        spawns: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<(i32, &'static str)>) -> Self {
            Self {
                script: Mutex::new(script),
                spawns: AtomicUsize::new(0),
            }
        }

        fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }
    }

    impl ProcessRunner for Scripted {
        fn run(&self, _: &CommandSpec, _: &RunControl) -> Result<InvocationResult> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let (code, stderr) = self.script.lock().unwrap().remove(0);
            Ok(InvocationResult {
                exit_code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
                duration: Duration::from_millis(1),
            })
        }
    }

    fn config(max_attempts: u32) -> EngineConfig {
        EngineConfig {
            policy: RetryPolicy {
                max_attempts,
                backoff: BackoffStrategy::Fixed { delay_ms: 5 },
                retryable_errors: vec![PatternSpec::substring("TLS handshake timeout")],
            },
            orchestration_enabled: false,
            attempt_timeout: None,
            no_color: true,
        }
    }

    /// Plan only, so one attempt is one spawn.
    fn vault_case() -> ModuleTestCase {
        ModuleTestCase::new("vault", "modules/vault")
            .with_backend(BackendSelector::Direct {
                binary: None,
                init: false,
                list_style: Default::default(),
            })
            .with_variables(
                VariableSet::builder()
                    .set("name", "vault-test")
                    .set("ha_enabled", false)
                    .set("replica_count", 1)
                    .build(),
            )
    }

    #[test]
    fn test_scenario_a_first_attempt_succeeds() {
        let engine = ExecutionEngine::with_runner(config(3), Scripted::new(vec![(0, "")])).unwrap();
        let report = engine.run(&vault_case(), &CancelToken::new());

        assert_eq!(report.outcome, Outcome::Passed);
        assert_eq!(report.attempts, 1);
        assert_eq!(
            report.states,
            vec![EngineState::Idle, EngineState::Invoking, EngineState::Succeeded]
        );
    }

    #[test]
    fn test_scenario_b_transient_then_success() {
        let runner = Scripted::new(vec![(1, "Error: net/http: TLS handshake timeout"), (0, "")]);
        let engine = ExecutionEngine::with_runner(config(3), runner).unwrap();
        let report = engine.run(&vault_case(), &CancelToken::new());

        assert_eq!(report.outcome, Outcome::Passed);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.backoff_ms, 5);
        assert_eq!(engine.runner().spawns(), 2);
    }

    #[test]
    fn test_scenario_c_fatal_error_single_attempt() {
        let runner = Scripted::new(vec![(1, "Error: Unsupported argument")]);
        let engine = ExecutionEngine::with_runner(config(5), runner).unwrap();
        let report = engine.run(&vault_case(), &CancelToken::new());

        assert!(matches!(
            report.outcome,
            Outcome::FailedFatal { kind: FailureKind::FatalExecution, .. }
        ));
        assert_eq!(report.attempts, 1);
        assert_eq!(report.total_backoff(), Duration::ZERO);
        assert_eq!(engine.runner().spawns(), 1);
        assert_eq!(report.last_exit_code, Some(1));
    }

    #[test]
    fn test_scenario_d_orchestrated_skipped_when_gated() {
        let engine = ExecutionEngine::with_runner(config(3), Scripted::new(vec![])).unwrap();
        let case = vault_case().with_backend(BackendSelector::orchestrated("../terragrunt/modules/vault"));
        let report = engine.run(&case, &CancelToken::new());

        assert!(matches!(report.outcome, Outcome::Skipped { .. }));
        assert_eq!(engine.runner().spawns(), 0);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.total_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_orchestrated_runs_when_enabled() {
        let mut cfg = config(3);
        cfg.orchestration_enabled = true;
        let engine = ExecutionEngine::with_runner(cfg, Scripted::new(vec![(0, "")])).unwrap();
        let case = vault_case().with_backend(BackendSelector::orchestrated("../terragrunt/modules/vault"));
        let report = engine.run(&case, &CancelToken::new());

        assert_eq!(report.outcome, Outcome::Passed);
        assert_eq!(engine.runner().spawns(), 1);
    }

    #[test]
    fn test_retries_exhausted_after_max_attempts() {
        let runner = Scripted::new(vec![(1, "TLS handshake timeout"); 4]);
        let engine = ExecutionEngine::with_runner(config(3), runner).unwrap();
        let report = engine.run(&vault_case(), &CancelToken::new());

        assert!(matches!(report.outcome, Outcome::FailedExhaustedRetries { .. }));
        assert_eq!(report.attempts, 3);
        assert_eq!(engine.runner().spawns(), 3);
        assert_eq!(report.backoff_ms, 10);
        assert_eq!(report.states.last(), Some(&EngineState::FailedExhausted));
    }

    #[test]
    fn test_single_attempt_policy_exhausts_immediately() {
        let runner = Scripted::new(vec![(1, "TLS handshake timeout")]);
        let engine = ExecutionEngine::with_runner(config(1), runner).unwrap();
        let report = engine.run(&vault_case(), &CancelToken::new());

        assert!(matches!(report.outcome, Outcome::FailedExhaustedRetries { .. }));
        assert_eq!(report.total_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_success_never_classified() {
        let engine = ExecutionEngine::with_runner(config(3), Scripted::new(vec![(0, "TLS handshake timeout")])).unwrap();
        let report = engine.run(&vault_case(), &CancelToken::new());
        assert!(!report.states.contains(&EngineState::Classifying));
    }

    #[test]
    fn test_marshal_error_is_fatal_without_spawn() {
        let engine = ExecutionEngine::with_runner(config(3), Scripted::new(vec![])).unwrap();
        let vars: VariableSet = [("settings", VarValue::Unsupported(serde_json::json!({ "a": 1 })))]
            .into_iter()
            .collect();
        let report = engine.run(&vault_case().with_variables(vars), &CancelToken::new());

        assert!(matches!(
            report.outcome,
            Outcome::FailedFatal { kind: FailureKind::Marshal, .. }
        ));
        assert_eq!(report.attempts, 0);
        assert_eq!(engine.runner().spawns(), 0);
        assert_eq!(report.states, vec![EngineState::Idle, EngineState::FailedFatal]);
    }

    #[test]
    fn test_cancelled_before_start() {
        let engine = ExecutionEngine::with_runner(config(3), Scripted::new(vec![])).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let report = engine.run(&vault_case(), &token);

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(!report.outcome.is_ok());
        assert_eq!(report.attempts, 0);
        assert_eq!(engine.runner().spawns(), 0);
        assert_eq!(report.states, vec![EngineState::Idle, EngineState::Cancelled]);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut cfg = config(0);
        assert!(ExecutionEngine::with_runner(cfg.clone(), Scripted::new(vec![])).is_err());

        cfg.policy.max_attempts = 1;
        cfg.policy.retryable_errors = vec![PatternSpec::regex("[")];
        assert!(ExecutionEngine::with_runner(cfg, Scripted::new(vec![])).is_err());
    }

    #[test]
    fn test_transitions() {
        let mut ctx = RunContext::new();
        assert!(ctx.transition_to(EngineState::Classifying).is_err());
        ctx.transition_to(EngineState::Invoking).unwrap();
        ctx.transition_to(EngineState::Classifying).unwrap();
        ctx.transition_to(EngineState::Retrying).unwrap();
        ctx.transition_to(EngineState::Invoking).unwrap();
        assert_eq!(ctx.attempt(), 2);
        ctx.transition_to(EngineState::Succeeded).unwrap();

        assert_eq!(
            ctx.transition_to(EngineState::Invoking),
            Err(TransitionError::FromTerminalState {
                from: EngineState::Succeeded
            })
        );
    }

    #[test]
    fn test_terminal_states() {
        for state in [
            EngineState::Succeeded,
            EngineState::FailedFatal,
            EngineState::FailedExhausted,
            EngineState::Cancelled,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(EngineState::Invoking));
        }
        assert!(!EngineState::Retrying.is_terminal());
    }
}
