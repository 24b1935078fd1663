//! Provisioning backends.
//!
//! A backend turns (module location, variable set) into one or more typed
//! invocations and runs them through a [`ProcessRunner`]. It never
//! interprets exit codes; that is the engine's job.
//!
//! The set of backends is closed:
//!
//! | Backend        | Working dir        | Commands                                 |
//! |----------------|--------------------|------------------------------------------|
//! | `Direct`       | module location    | `init -input=false`, `plan -input=false -var ...` |
//! | `Orchestrated` | composed config dir| `<subcommand>` (default `validate`)      |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use strum::Display;
use tracing::debug;

use crate::error::{MarshalError, Result};
use crate::runner::{CommandSpec, InvocationResult, ProcessRunner, RunControl};
use crate::variables::{ListStyle, VariableSet};

/// Canonical direct provisioning binary.
pub const DEFAULT_DIRECT_BINARY: &str = "terraform";

/// Canonical orchestration wrapper binary.
pub const DEFAULT_ORCHESTRATOR_BINARY: &str = "terragrunt";

/// Default orchestrated subcommand.
pub const DEFAULT_ORCHESTRATED_SUBCOMMAND: &str = "validate";

/// Typed arguments for one provisioning tool subcommand.
///
/// Implementors own the mapping from their fields to argv and
/// environment, so flag spelling lives in exactly one place.
///
/// # Contract
///
/// - `subcommand()`: the tool subcommand (e.g. `"plan"`)
/// - `to_cli_args()`: every argument after the binary, subcommand first
/// - `env_vars()`: environment the tool needs for unattended runs
pub trait InvocationArgs {
    fn subcommand(&self) -> &str;

    /// # Errors
    ///
    /// Returns a `MarshalError` if a variable has no argument form.
    fn to_cli_args(&self) -> std::result::Result<Vec<String>, MarshalError>;

    fn env_vars(&self) -> Vec<(String, String)>;
}

/// `<bin> init -input=false [-no-color]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitArgs {
    pub no_color: bool,
}

impl InvocationArgs for InitArgs {
    fn subcommand(&self) -> &str {
        "init"
    }

    fn to_cli_args(&self) -> std::result::Result<Vec<String>, MarshalError> {
        let mut args = vec![self.subcommand().to_string(), "-input=false".to_string()];
        if self.no_color {
            args.push("-no-color".to_string());
        }
        Ok(args)
    }

    fn env_vars(&self) -> Vec<(String, String)> {
        automation_env()
    }
}

/// `<bin> plan -input=false [-var key=value]... [-no-color]`
#[derive(Debug, Clone)]
pub struct PlanArgs<'a> {
    pub vars: &'a VariableSet,
    pub list_style: ListStyle,
    pub no_color: bool,
}

impl InvocationArgs for PlanArgs<'_> {
    fn subcommand(&self) -> &str {
        "plan"
    }

    fn to_cli_args(&self) -> std::result::Result<Vec<String>, MarshalError> {
        let mut args = vec![self.subcommand().to_string(), "-input=false".to_string()];
        args.extend(self.vars.to_cli_args(self.list_style)?);
        if self.no_color {
            args.push("-no-color".to_string());
        }
        Ok(args)
    }

    fn env_vars(&self) -> Vec<(String, String)> {
        automation_env()
    }
}

/// `<wrapper> <subcommand>`; the wrapper supplies its own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperArgs {
    pub subcommand: String,
}

impl InvocationArgs for WrapperArgs {
    fn subcommand(&self) -> &str {
        &self.subcommand
    }

    fn to_cli_args(&self) -> std::result::Result<Vec<String>, MarshalError> {
        Ok(vec![self.subcommand.clone()])
    }

    fn env_vars(&self) -> Vec<(String, String)> {
        vec![("TERRAGRUNT_NON_INTERACTIVE".to_string(), "true".to_string())]
    }
}

fn automation_env() -> Vec<(String, String)> {
    vec![("TF_IN_AUTOMATION".to_string(), "1".to_string())]
}

/// Which backend a test case uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Direct,
    Orchestrated,
}

/// Declared backend choice of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSelector {
    Direct {
        /// Binary override; defaults to `terraform`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binary: Option<String>,
        /// Run `init` before `plan`.
        #[serde(default = "default_true")]
        init: bool,
        #[serde(default)]
        list_style: ListStyle,
    },
    Orchestrated {
        /// Binary override; defaults to `terragrunt`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binary: Option<String>,
        /// Composed configuration the wrapper runs from.
        config_dir: PathBuf,
        #[serde(default = "default_subcommand")]
        subcommand: String,
    },
}

fn resolve_binary(binary: &mut Option<String>, base: &Path) {
    if let Some(name) = binary {
        if name.contains('/') && Path::new(name.as_str()).is_relative() {
            *name = base.join(name.as_str()).to_string_lossy().into_owned();
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_subcommand() -> String {
    DEFAULT_ORCHESTRATED_SUBCOMMAND.to_string()
}

impl Default for BackendSelector {
    fn default() -> Self {
        BackendSelector::direct()
    }
}

impl BackendSelector {
    /// Direct backend with the canonical binary.
    pub fn direct() -> Self {
        BackendSelector::Direct {
            binary: None,
            init: true,
            list_style: ListStyle::default(),
        }
    }

    /// Orchestrated backend with the canonical wrapper.
    pub fn orchestrated(config_dir: impl Into<PathBuf>) -> Self {
        BackendSelector::Orchestrated {
            binary: None,
            config_dir: config_dir.into(),
            subcommand: default_subcommand(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSelector::Direct { .. } => BackendKind::Direct,
            BackendSelector::Orchestrated { .. } => BackendKind::Orchestrated,
        }
    }

    /// Effective binary name.
    pub fn binary(&self) -> &str {
        match self {
            BackendSelector::Direct { binary, .. } => {
                binary.as_deref().unwrap_or(DEFAULT_DIRECT_BINARY)
            }
            BackendSelector::Orchestrated { binary, .. } => {
                binary.as_deref().unwrap_or(DEFAULT_ORCHESTRATOR_BINARY)
            }
        }
    }

    /// Replace the binary.
    pub fn with_binary(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            BackendSelector::Direct { binary, .. } | BackendSelector::Orchestrated { binary, .. } => {
                *binary = Some(name.into());
            }
        }
        self
    }

    /// Resolve relative paths against `base` (the suite file's directory).
    ///
    /// Binary overrides are resolved too when they name a path (contain
    /// `/`); bare names are left for `PATH` lookup.
    pub fn resolve_paths(&mut self, base: &Path) {
        match self {
            BackendSelector::Direct { binary, .. } => resolve_binary(binary, base),
            BackendSelector::Orchestrated {
                binary, config_dir, ..
            } => {
                resolve_binary(binary, base);
                if config_dir.is_relative() {
                    *config_dir = base.join(&*config_dir);
                }
            }
        }
    }

    /// Build the backend, resolving defaults.
    pub fn build(&self, no_color: bool) -> Backend {
        match self {
            BackendSelector::Direct {
                init, list_style, ..
            } => Backend::Direct(DirectBackend {
                binary: self.binary().to_string(),
                init: *init,
                list_style: *list_style,
                no_color,
                extra_env: Vec::new(),
            }),
            BackendSelector::Orchestrated {
                config_dir,
                subcommand,
                ..
            } => Backend::Orchestrated(OrchestratedBackend {
                binary: self.binary().to_string(),
                config_dir: config_dir.clone(),
                subcommand: subcommand.clone(),
                extra_env: Vec::new(),
            }),
        }
    }
}

/// Runs the provisioning binary against one module directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectBackend {
    pub binary: String,
    pub init: bool,
    pub list_style: ListStyle,
    pub no_color: bool,
    /// Test-case environment, applied after the tool defaults.
    pub extra_env: Vec<(String, String)>,
}

impl DirectBackend {
    fn commands(&self, module: &Path, vars: &VariableSet) -> std::result::Result<Vec<CommandSpec>, MarshalError> {
        let plan = PlanArgs {
            vars,
            list_style: self.list_style,
            no_color: self.no_color,
        };
        // Marshal first: a bad variable set must not cost an init
        let plan = self.spec(module, &plan)?;

        let mut commands = Vec::with_capacity(2);
        if self.init {
            commands.push(self.spec(module, &InitArgs { no_color: self.no_color })?);
        }
        commands.push(plan);
        Ok(commands)
    }

    fn spec(&self, module: &Path, args: &impl InvocationArgs) -> std::result::Result<CommandSpec, MarshalError> {
        Ok(CommandSpec {
            program: self.binary.clone(),
            args: args.to_cli_args()?,
            cwd: module.to_path_buf(),
            env: merge_env(args.env_vars(), &self.extra_env),
        })
    }
}

/// Runs the orchestration wrapper from a composed configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratedBackend {
    pub binary: String,
    pub config_dir: PathBuf,
    pub subcommand: String,
    pub extra_env: Vec<(String, String)>,
}

impl OrchestratedBackend {
    fn commands(&self) -> std::result::Result<Vec<CommandSpec>, MarshalError> {
        let args = WrapperArgs {
            subcommand: self.subcommand.clone(),
        };
        Ok(vec![CommandSpec {
            program: self.binary.clone(),
            args: args.to_cli_args()?,
            cwd: self.config_dir.clone(),
            env: merge_env(args.env_vars(), &self.extra_env),
        }])
    }
}

/// Tool defaults first, overridden by test-case entries with the same name.
fn merge_env(mut base: Vec<(String, String)>, extra: &[(String, String)]) -> Vec<(String, String)> {
    for (key, value) in extra {
        match base.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => base.push((key.clone(), value.clone())),
        }
    }
    base
}

/// A provisioning backend, ready to invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Direct(DirectBackend),
    Orchestrated(OrchestratedBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Direct(_) => BackendKind::Direct,
            Backend::Orchestrated(_) => BackendKind::Orchestrated,
        }
    }

    /// Attach test-case environment to every command.
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env: Vec<(String, String)> = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        match &mut self {
            Backend::Direct(b) => b.extra_env = env,
            Backend::Orchestrated(b) => b.extra_env = env,
        }
        self
    }

    pub fn binary(&self) -> &str {
        match self {
            Backend::Direct(b) => &b.binary,
            Backend::Orchestrated(b) => &b.binary,
        }
    }

    /// Directory the final command runs in.
    pub fn working_dir<'a>(&'a self, module: &'a Path) -> &'a Path {
        match self {
            Backend::Direct(_) => module,
            Backend::Orchestrated(b) => &b.config_dir,
        }
    }

    /// Commands one attempt runs, in order.
    ///
    /// The orchestrated backend ignores `vars`.
    pub fn commands(&self, module: &Path, vars: &VariableSet) -> std::result::Result<Vec<CommandSpec>, MarshalError> {
        match self {
            Backend::Direct(b) => b.commands(module, vars),
            Backend::Orchestrated(b) => b.commands(),
        }
    }

    /// Run one attempt: every command in order, stopping at the first
    /// non-zero exit. The returned result is the last command run, with
    /// the total elapsed time of the attempt. The time limit in `control`
    /// covers the attempt as a whole.
    ///
    /// # Errors
    ///
    /// `Marshal`, `Launch`, `TimedOut` and `Cancelled` from the runner.
    pub fn invoke<R: ProcessRunner + ?Sized>(
        &self,
        runner: &R,
        module: &Path,
        vars: &VariableSet,
        control: &RunControl,
    ) -> Result<InvocationResult> {
        let commands = self.commands(module, vars)?;
        let control = control.start_attempt();
        let mut total = std::time::Duration::ZERO;
        let mut last = None;

        for command in &commands {
            debug!(backend = %self.kind(), command = %command, "invoking");
            let result = runner.run(command, &control)?;
            total += result.duration;
            let failed = !result.success();
            last = Some(result);
            if failed {
                break;
            }
        }

        // commands() never returns an empty list
        let mut result = last.unwrap_or(InvocationResult {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration: total,
        });
        result.duration = total;
        Ok(result)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind(), self.binary())
    }
}
