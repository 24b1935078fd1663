use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::variables::VarValue;

/// planharness - plan/validate infrastructure modules with retry on transient failures
#[derive(Parser, Debug)]
#[command(name = "planharness")]
#[command(about = "Validate infrastructure-as-code modules against their provisioning tool")]
#[command(version)]
pub struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every test case of a suite file
    Run {
        /// Path to the suite file (JSON)
        suite: PathBuf,

        /// Number of test cases to run concurrently [default: available CPUs]
        #[arg(short, long, value_parser = parse_jobs)]
        jobs: Option<usize>,

        /// Only run tests whose name contains this string
        #[arg(long)]
        filter: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Validate a suite file without running anything
    Validate {
        /// Path to the suite file (JSON)
        suite: PathBuf,
    },
    /// Plan a single module with the direct backend
    Check {
        /// Module directory
        module: PathBuf,

        /// Provisioning tool to invoke
        #[arg(long)]
        binary: Option<String>,

        /// Input variable as key=value; values that parse as JSON keep their type
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, VarValue)>,

        /// Skip the init step
        #[arg(long)]
        no_init: bool,

        /// Attempts allowed for transient failures
        #[arg(long)]
        max_attempts: Option<u32>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Parse a `key=value` variable declaration.
///
/// `count=3` is an integer, `ha=false` a bool, `zones=["a","b"]` a list;
/// anything that is not valid JSON stays a string.
pub fn parse_var(raw: &str) -> Result<(String, VarValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }

    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(json) => VarValue::from(json),
        Err(_) => VarValue::String(value.to_string()),
    };
    Ok((key.to_string(), value))
}

fn parse_jobs(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
