//! Suite files and the parallel suite runner.
//!
//! A suite file is the JSON declaration of a set of module test cases plus
//! the engine settings they share. Relative paths inside it are resolved
//! against the file's own directory, so a suite can live next to the
//! modules it validates.
//!
//! Test cases are independent and run on a fixed pool of worker threads.
//! Cases whose tool would run in the same directory share a lane and run
//! one after another: provisioning tools lock their working directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::backend::BackendSelector;
use crate::engine::{DEFAULT_ORCHESTRATION_ENV, EngineConfig, ExecutionEngine, Report};
use crate::retry::{RetryClassifier, RetryPolicy};
use crate::runner::{CancelToken, ProcessRunner};
use crate::test_case::{ModuleTestCase, Verdict};

/// Declared suite of module test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteFile {
    /// Environment variable gating orchestrated cases.
    #[serde(default = "default_orchestration_env")]
    pub orchestration_env: String,
    #[serde(default = "default_true")]
    pub no_color: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub tests: Vec<ModuleTestCase>,
}

fn default_orchestration_env() -> String {
    DEFAULT_ORCHESTRATION_ENV.to_string()
}

fn default_true() -> bool {
    true
}

impl SuiteFile {
    /// Load a suite from a JSON file, resolving relative paths against
    /// the file's directory
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read suite file {:?}", path))?;

        let mut suite: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse suite file {:?}", path))?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        for case in &mut suite.tests {
            case.resolve_paths(base);
        }

        debug!(path = %path.display(), tests = suite.tests.len(), "loaded suite");
        Ok(suite)
    }

    /// Validate the suite
    pub fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            anyhow::bail!("Suite declares no tests");
        }

        if self.orchestration_env.trim().is_empty() {
            anyhow::bail!("orchestration_env must name an environment variable");
        }

        if self.attempt_timeout_secs == Some(0) {
            anyhow::bail!("attempt_timeout_secs must be positive");
        }

        self.retry.validate()?;
        RetryClassifier::new(&self.retry.retryable_errors)?;

        let mut names = HashSet::new();
        for case in &self.tests {
            let name = case.name.trim();
            if name.is_empty() {
                anyhow::bail!("Test with module {:?} has an empty name", case.module);
            }
            if !names.insert(name) {
                anyhow::bail!("Duplicate test name '{}'", name);
            }

            match &case.backend {
                BackendSelector::Direct { binary, .. } | BackendSelector::Orchestrated { binary, .. }
                    if binary.as_deref().is_some_and(|b| b.trim().is_empty()) =>
                {
                    anyhow::bail!("Test '{}': binary override is empty", name);
                }
                BackendSelector::Orchestrated { subcommand, .. } if subcommand.trim().is_empty() => {
                    anyhow::bail!("Test '{}': orchestrated subcommand is empty", name);
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Engine settings for this suite with the gate value supplied by the
    /// caller (usually from [`EngineConfig::orchestration_gate_from_env`]).
    pub fn engine_config(&self, orchestration_enabled: bool) -> EngineConfig {
        EngineConfig {
            policy: self.retry.clone(),
            orchestration_enabled,
            attempt_timeout: self.attempt_timeout_secs.map(Duration::from_secs),
            no_color: self.no_color,
        }
    }

    /// Keep only tests whose name contains `pattern`.
    pub fn filter(&mut self, pattern: &str) {
        self.tests.retain(|case| case.name.contains(pattern));
    }
}

/// Report and verdict of one test case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    #[serde(flatten)]
    pub report: Report,
    pub verdict: Verdict,
}

/// Results of a whole suite run, in declaration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteSummary {
    pub results: Vec<CaseResult>,
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl SuiteSummary {
    fn from_results(results: Vec<CaseResult>, cancelled: bool) -> Self {
        let mut summary = Self {
            cancelled,
            ..Self::default()
        };
        for result in &results {
            match result.verdict {
                Verdict::Pass => summary.passed += 1,
                Verdict::Skip => summary.skipped += 1,
                Verdict::Fail(_) => summary.failed += 1,
            }
        }
        summary.results = results;
        summary
    }

    /// Every case passed or was skipped.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Process exit status for this summary.
    pub fn exit_code(&self) -> u8 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.failed > 0 {
            EXIT_FAILED
        } else {
            EXIT_OK
        }
    }

    /// Human-readable report, one line per case plus a totals line.
    pub fn render_text(&self) -> String {
        let width = self
            .results
            .iter()
            .map(|r| r.report.name.len())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        for CaseResult { report, verdict } in &self.results {
            let label = match verdict {
                Verdict::Pass => "PASS",
                Verdict::Skip => "SKIP",
                Verdict::Fail(_) => "FAIL",
            };
            let attempts = match report.attempts {
                1 => "1 attempt".to_string(),
                n => format!("{} attempts", n),
            };
            let _ = write!(
                out,
                "{}  {:<width$}  [{}] ({}, {:.1}s)",
                label,
                report.name,
                report.backend,
                attempts,
                report.elapsed_ms as f64 / 1000.0,
            );
            match verdict {
                Verdict::Fail(reason) => {
                    let _ = write!(out, ": {}", reason);
                }
                Verdict::Skip => {
                    if let Some(reason) = report.outcome.reason() {
                        let _ = write!(out, ": {}", reason);
                    }
                }
                Verdict::Pass => {}
            }
            out.push('\n');
        }

        let _ = writeln!(
            out,
            "{} tests: {} passed, {} failed, {} skipped{}",
            self.results.len(),
            self.passed,
            self.failed,
            self.skipped,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        out
    }
}

/// All cases passed or were skipped.
pub const EXIT_OK: u8 = 0;
/// At least one case failed.
pub const EXIT_FAILED: u8 = 1;
/// The suite or command line could not be used.
pub const EXIT_CONFIG: u8 = 2;
/// The run was interrupted.
pub const EXIT_CANCELLED: u8 = 130;

/// Identity of a working directory: symlinks and `..` resolved when the
/// directory exists, `.`/`..` folded lexically when it does not.
fn lane_key(dir: &Path) -> PathBuf {
    if let Ok(real) = dir.canonicalize() {
        return real;
    }
    let mut key = PathBuf::new();
    for component in dir.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir if matches!(key.components().next_back(), Some(Component::Normal(_))) => {
                key.pop();
            }
            other => key.push(other.as_os_str()),
        }
    }
    key
}

/// Group case indices by working directory, preserving declaration order
/// within each lane.
fn lanes(cases: &[ModuleTestCase]) -> VecDeque<Vec<usize>> {
    let mut by_dir: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
    let mut order = Vec::new();
    for (index, case) in cases.iter().enumerate() {
        let dir = lane_key(&case.working_dir());
        let lane = by_dir.entry(dir.clone()).or_default();
        if lane.is_empty() {
            order.push(dir);
        }
        lane.push(index);
    }
    order
        .into_iter()
        .filter_map(|dir| by_dir.remove(&dir))
        .collect()
}

/// Run every case of `cases` on up to `jobs` worker threads.
pub fn run_cases<R: ProcessRunner>(
    engine: &ExecutionEngine<R>,
    cases: &[ModuleTestCase],
    jobs: usize,
    cancel: &CancelToken,
) -> SuiteSummary {
    let lanes = lanes(cases);
    let workers = jobs.clamp(1, lanes.len().max(1));
    let queue = Arc::new(Mutex::new(lanes));
    let (tx, rx) = mpsc::channel::<(usize, CaseResult)>();

    info!(tests = cases.len(), workers, "running suite");

    thread::scope(|scope| {
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            scope.spawn(move || {
                debug!(worker, "suite worker started");
                loop {
                    let lane = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => None,
                    };
                    let Some(lane) = lane else { break };

                    for index in lane {
                        let case = &cases[index];
                        let report = engine.run(case, cancel);
                        let verdict = case.verdict(&report);
                        if tx.send((index, CaseResult { report, verdict })).is_err() {
                            error!("Failed to send case result. Receiver dropped.");
                            return;
                        }
                    }
                }
                debug!(worker, "suite worker finished");
            });
        }
    });
    drop(tx);

    let mut indexed: Vec<(usize, CaseResult)> = rx.into_iter().collect();
    indexed.sort_by_key(|(index, _)| *index);
    SuiteSummary::from_results(
        indexed.into_iter().map(|(_, result)| result).collect(),
        cancel.is_cancelled(),
    )
}
