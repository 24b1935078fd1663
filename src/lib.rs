//! planharness library
//!
//! Runs infrastructure modules through their provisioning tool (plan, or an
//! orchestration wrapper's validate) and reports one outcome per test case,
//! retrying failures that match known transient signatures.

pub mod backend;
pub mod cli;
pub mod engine;
pub mod error;
pub mod process_guard;
pub mod retry;
pub mod runner;
pub mod suite;
pub mod test_case;
pub mod variables;

pub use backend::{Backend, BackendKind, BackendSelector, DirectBackend, OrchestratedBackend};
pub use engine::{
    EngineConfig, EngineState, ExecutionEngine, FailureKind, Outcome, Report, RunContext,
    TransitionError,
};
pub use error::{HarnessError, MarshalError};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use retry::{BackoffStrategy, Classification, PatternSpec, RetryClassifier, RetryPolicy};
pub use runner::{CancelToken, CommandSpec, InvocationResult, ProcessRunner, RunControl, SystemRunner};
pub use suite::{SuiteFile, SuiteSummary, run_cases};
pub use test_case::{Expectation, ModuleTestCase, Verdict};
pub use variables::{ListStyle, VarValue, VariableSet};
