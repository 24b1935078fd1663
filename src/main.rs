//! planharness - main entry point

use std::path::Path;
use std::process::ExitCode;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use planharness::backend::BackendSelector;
use planharness::cli::{Cli, Commands, OutputFormat};
use planharness::engine::{EngineConfig, ExecutionEngine};
use planharness::process_guard::{self, ProcessGuard};
use planharness::runner::CancelToken;
use planharness::suite::{self, EXIT_CONFIG, SuiteFile, SuiteSummary};
use planharness::test_case::ModuleTestCase;
use planharness::variables::VariableSet;

/// Log to stderr; RUST_LOG overrides the level picked by the flags.
fn init_logger(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logger(cli.verbose, cli.quiet);
    debug!("planharness starting up");

    let cancel = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let code = match cli.command {
        Commands::Validate { suite } => validate_suite(&suite),
        Commands::Run {
            suite,
            jobs,
            filter,
            format,
        } => {
            let jobs = jobs.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
            run_suite(&suite, jobs, filter.as_deref(), format, &cancel)
        }
        Commands::Check {
            module,
            binary,
            vars,
            no_init,
            max_attempts,
            format,
        } => {
            let mut backend = BackendSelector::Direct {
                binary: None,
                init: !no_init,
                list_style: Default::default(),
            };
            if let Some(binary) = binary {
                backend = backend.with_binary(binary);
            }
            let name = module.display().to_string();
            let case = ModuleTestCase::new(name, module)
                .with_backend(backend)
                .with_variables(vars.into_iter().collect::<VariableSet>());

            let mut config = EngineConfig::default();
            if let Some(max_attempts) = max_attempts {
                config.policy.max_attempts = max_attempts;
            }
            run_engine(config, &[case], 1, format, &cancel)
        }
    };

    ExitCode::from(code)
}

fn load_suite(path: &Path) -> Option<SuiteFile> {
    let loaded = SuiteFile::load_from_file(path).and_then(|suite| {
        suite.validate()?;
        Ok(suite)
    });
    match loaded {
        Ok(suite) => Some(suite),
        Err(e) => {
            error!("Suite {:?} is not usable: {:#}", path, e);
            eprintln!("✗ Suite file is not usable: {:#}", e);
            None
        }
    }
}

fn validate_suite(path: &Path) -> u8 {
    info!("Validating suite file: {:?}", path);
    match load_suite(path) {
        Some(suite) => {
            println!("✓ Suite file is valid: {} tests", suite.tests.len());
            suite::EXIT_OK
        }
        None => EXIT_CONFIG,
    }
}

fn run_suite(
    path: &Path,
    jobs: usize,
    filter: Option<&str>,
    format: OutputFormat,
    cancel: &CancelToken,
) -> u8 {
    let Some(mut suite) = load_suite(path) else {
        return EXIT_CONFIG;
    };

    if let Some(pattern) = filter {
        suite.filter(pattern);
        if suite.tests.is_empty() {
            eprintln!("✗ No tests match '{}'", pattern);
            return EXIT_CONFIG;
        }
    }

    let gate = EngineConfig::orchestration_gate_from_env(&suite.orchestration_env);
    debug!(env = %suite.orchestration_env, enabled = gate, "orchestration gate");
    run_engine(suite.engine_config(gate), &suite.tests, jobs, format, cancel)
}

fn run_engine(
    config: EngineConfig,
    cases: &[ModuleTestCase],
    jobs: usize,
    format: OutputFormat,
    cancel: &CancelToken,
) -> u8 {
    let engine = match ExecutionEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Invalid engine configuration: {}", e);
            eprintln!("✗ {}", e);
            return EXIT_CONFIG;
        }
    };

    let summary = suite::run_cases(&engine, cases, jobs, cancel);
    print_summary(&summary, format);
    summary.exit_code()
}

fn print_summary(summary: &SuiteSummary, format: OutputFormat) {
    match format {
        OutputFormat::Text => print!("{}", summary.render_text()),
        OutputFormat::Json => match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize summary: {}", e),
        },
    }
}
