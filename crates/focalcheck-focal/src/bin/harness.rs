//! CLI entrypoint for the focalcheck harness.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};

use focalcheck_harness::structured_log::{self, LogEmitter, RunLogger};
use focalcheck_harness::{Reporter, RunReport, TestRegistry, TestRunner};

/// Runs the registered focal-routine suite.
///
/// With no subcommand, behaves like `harness run`.
#[derive(Debug, Parser)]
#[command(name = "harness")]
#[command(about = "Unit-test harness for focal routines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    #[default]
    Text,
    Json,
    Markdown,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Only run cases whose name contains this substring.
    #[arg(long)]
    filter: Option<String>,
    /// Output format for stdout.
    #[arg(long, value_enum, default_value = "text")]
    format: Format,
    /// Write a markdown report here (plus a `.json` sibling).
    #[arg(long)]
    report: Option<PathBuf>,
    /// Write a JSONL structured log here.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Optional fixed timestamp string for deterministic report generation.
    #[arg(long)]
    timestamp: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the suite and exit non-zero unless every case passes.
    Run(RunArgs),
    /// Print registered case names in run order.
    List,
    /// Validate a JSONL structured log.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn registry() -> Result<TestRegistry, Box<dyn std::error::Error>> {
    let mut registry = TestRegistry::new();
    focalcheck_focal::register_all(&mut registry)?;
    Ok(registry)
}

fn run(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let RunArgs {
        filter,
        format,
        report,
        log,
        timestamp,
    } = args;
    let mut registry = registry()?;
    let mut runner = TestRunner::new(focalcheck_focal::SUITE_NAME);
    runner.filter = filter;
    let timestamp = timestamp.unwrap_or_else(structured_log::now_utc);

    let results = match &log {
        Some(path) => {
            let emitter = LogEmitter::to_file(path, &runner.suite, &timestamp)?;
            let mut logger = RunLogger::new(emitter);
            let results = runner.run_logged(&mut registry, &mut logger);
            if let Err(err) = logger.finish() {
                eprintln!("Structured log {} is incomplete: {err}", path.display());
            }
            results
        }
        None => runner.run(&mut registry),
    };

    let exit_code = Reporter::exit_code(&results);
    let report_doc = RunReport::new(
        "focalcheck Run Report",
        runner.suite.clone(),
        timestamp,
        results,
    );

    let mut stdout = std::io::stdout().lock();
    match format {
        Format::Text => Reporter::new()
            .with_notes(true)
            .report(&report_doc.results, &mut stdout)?,
        Format::Json => writeln!(stdout, "{}", report_doc.to_json()?)?,
        Format::Markdown => write!(stdout, "{}", report_doc.to_markdown())?,
    }

    if let Some(report_path) = report {
        eprintln!("Writing report to {}", report_path.display());
        std::fs::write(&report_path, report_doc.to_markdown())?;
        let json_path = report_path.with_extension("json");
        std::fs::write(&json_path, report_doc.to_json()?)?;
    }

    Ok(ExitCode::from(u8::try_from(exit_code).unwrap_or(1)))
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => run(args),
        Command::List => {
            let registry = registry()?;
            let mut stdout = std::io::stdout().lock();
            for name in registry.names() {
                writeln!(stdout, "{name}")?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ValidateLog { log } => {
            let (line_count, errors) = structured_log::validate_log_file(&log)?;
            if errors.is_empty() {
                eprintln!("{}: {line_count} lines, all valid", log.display());
                return Ok(ExitCode::SUCCESS);
            }
            for err in &errors {
                eprintln!("{err}");
            }
            eprintln!(
                "{}: {} violations in {line_count} lines",
                log.display(),
                errors.len()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
