use anyhow::Result;
use clap::Parser;
use optrap::cli::{Cli, Command, OutputFormat};
use optrap::selftest::{run_selftest, SelftestReport};
use optrap::EngineConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_report(report: &SelftestReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            println!("=== optrap self-test ===");
            for check in &report.checks {
                let status = if check.passed { "PASS" } else { "FAIL" };
                println!("[{}] {:<36} {}", status, check.name, check.detail);
            }
            println!("─────────────────────────────────────────");
            let stats = &report.stats;
            println!(
                "interceptor {}: {} payload(s), {} replaced operation(s), {} watched, {} record(s)",
                stats.name, stats.payloads, stats.replaced_operations, stats.watched, stats.records
            );
            for factory in &stats.factories {
                println!(
                    "factory {}: {} prototype(s), {} record(s)",
                    factory.name, factory.prototypes, factory.records
                );
            }
            if report.passed() {
                println!("All {} checks passed", report.checks.len());
            } else {
                println!(
                    "{} of {} checks failed",
                    report.failures(),
                    report.checks.len()
                );
            }
        }
    }
    Ok(())
}

fn check_config(path: &Path, format: OutputFormat) -> Result<()> {
    let config = EngineConfig::from_file(path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => {
            println!("Configuration OK: {}", path.display());
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Selftest { config, format } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(path)?,
                None => EngineConfig::default(),
            };
            let report = run_selftest(&config)?;
            print_report(&report, format)?;
            if !report.passed() {
                anyhow::bail!("{} self-test check(s) failed", report.failures());
            }
        }
        Command::CheckConfig { path, format } => check_config(&path, format)?,
    }

    Ok(())
}
