//! Offline inspector for folio index state files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use folio::admin::{self, PendingReport, SummaryReport, TreeSummary, VerifyReport};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "folio-inspect",
    version,
    about = "Inspect a folio index state file and its page cache",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "STATE_FILE", help = "Path to a <source>#<index>.index file")]
    state_file: PathBuf,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Show the stored definition, cursor and tree shapes")]
    Summary,
    #[command(about = "Check both trees and their agreement")]
    Verify,
    #[command(about = "List queued events")]
    Pending,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(&T),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn print_tree(name: &str, tree: Option<&TreeSummary>) {
    match tree {
        Some(tree) => println!(
            "  {name:<8} page_size={} height={} entries={} pages={}",
            tree.page_size, tree.height, tree.entries, tree.pages
        ),
        None => println!("  {name:<8} (not built)"),
    }
}

fn print_summary(report: &SummaryReport) {
    println!("State file: {}", report.state_path.display());
    println!("  version  {}", report.version);
    match &report.definition {
        Some(definition) => println!(
            "  index    {} from {:?} keys={}",
            definition.kind.type_name(),
            definition.from,
            definition.keys.len()
        ),
        None => println!("  index    (no definition)"),
    }
    println!(
        "  cursor   {}",
        report.source_cursor.as_deref().unwrap_or("(none)")
    );
    println!("  pending  {}", report.pending_events);
    print_tree("forward", report.forward.as_ref());
    print_tree("reverse", report.reverse.as_ref());
}

fn print_verify(report: &VerifyReport) {
    if report.success {
        println!("ok: {} pages checked", report.pages_checked);
        return;
    }
    println!("FAILED: {} finding(s)", report.findings.len());
    for finding in &report.findings {
        println!("  [{}] {}", finding.scope, finding.message);
    }
}

fn print_pending(report: &PendingReport) {
    println!("{} pending event(s)", report.events.len());
    for (slot, event) in report.events.iter().enumerate() {
        println!("  {slot:>4} {event}");
    }
    if report.corrupt > 0 {
        println!("  {} corrupt entr(ies) will be skipped", report.corrupt);
    }
}

fn run(cli: Cli) -> Result<bool, Box<dyn Error>> {
    match cli.command {
        Command::Summary => {
            let report = admin::summary(&cli.state_file)?;
            emit(cli.format, &report, print_summary)?;
            Ok(true)
        }
        Command::Verify => {
            let report = admin::verify(&cli.state_file)?;
            emit(cli.format, &report, print_verify)?;
            Ok(report.success)
        }
        Command::Pending => {
            let report = admin::pending(&cli.state_file)?;
            emit(cli.format, &report, print_pending)?;
            Ok(true)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}
