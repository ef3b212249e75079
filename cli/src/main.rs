use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yesses_core::output::{render_json, steps_table, summary_table};
use yesses_core::{
    Config, Diagnostic, DiagnosticLevel, ModuleRegistry, ModuleSpec, RunOptions, RunOutcome,
    Runner, Severity,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Declarative scanning of networks and web applications")]
struct YessesCli {
    /// Show debug messages (overridden by YESSES_LOG)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline described by a configuration file
    Run {
        /// Configuration file in YAML format
        config: PathBuf,
        /// Resume scanning after the last step recorded in the resume files
        #[arg(short, long)]
        resume: bool,
        /// Repeat the last N completed steps; duplicate outputs are tolerated
        #[arg(long, value_name = "N")]
        repeat: Option<usize>,
        /// Ignore existing state files
        #[arg(short, long, conflicts_with_all = ["resume", "repeat"])]
        fresh: bool,
        /// Exit with status 1 when an alert of at least this severity was raised
        #[arg(long, value_name = "SEVERITY", default_value = "medium")]
        fail_on: Severity,
        /// Print the run report as JSON instead of tables
        #[arg(long)]
        json: bool,
    },
    /// Load and validate a configuration without running any module
    Check {
        /// Configuration file in YAML format
        config: PathBuf,
        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },
    /// List available modules with their inputs and outputs
    Modules {
        /// Output format
        #[arg(long, default_value_t = CatalogueFormat::Yaml)]
        format: CatalogueFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CatalogueFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for CatalogueFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            CatalogueFormat::Json => "json",
            CatalogueFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Serialize)]
struct Catalogue<'a> {
    modules: Vec<&'a ModuleSpec>,
}

fn main() -> ExitCode {
    let cli = YessesCli::parse();
    init_tracing(cli.verbose);

    match execute(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("YESSES_LOG")
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn execute(command: Command) -> anyhow::Result<ExitCode> {
    let modules = ModuleRegistry::with_builtins()?;

    match command {
        Command::Run {
            config,
            resume,
            repeat,
            fresh,
            fail_on,
            json,
        } => {
            let config = Config::load(&config, &modules)?;
            print_diagnostics(&config.warnings);
            let options = RunOptions {
                resume,
                repeat,
                fresh,
            };
            let runner = Runner::new(config, &modules, options)?;
            let outcome = runner.run()?;
            output_run(&outcome, json)?;
            if outcome.has_alert_at_least(fail_on) {
                return Ok(ExitCode::from(1));
            }
        }
        Command::Check { config, json } => {
            let path = config.clone();
            let loaded = Config::load(&config, &modules)
                .with_context(|| format!("configuration {} is not valid", path.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&loaded.warnings)?);
            } else {
                print_diagnostics(&loaded.warnings);
                println!(
                    "{}: {} step(s), {} initial finding key(s), {} output(s)",
                    path.display(),
                    loaded.steps.len(),
                    loaded.initial.len(),
                    loaded.outputs.len()
                );
            }
        }
        Command::Modules { format } => {
            let catalogue = Catalogue {
                modules: modules.specs().collect(),
            };
            match format {
                CatalogueFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&catalogue)?);
                }
                CatalogueFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&catalogue)?;
                    print!("{yaml}");
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn output_run(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    let report = &outcome.report;
    if json {
        println!("{}", render_json(report)?);
        return Ok(());
    }

    println!("{}", steps_table(&report.steps));
    println!();
    if report.alerts.is_empty() {
        println!("No alerts.");
    } else {
        println!("Alerts:");
        for alert in &report.alerts {
            print!("{alert}");
        }
    }
    println!();
    println!("{}", summary_table(&report.summary));
    match report.summary.max_severity {
        Some(severity) => println!("Highest severity: {severity}"),
        None => println!("Highest severity: none"),
    }
    if !outcome.written.is_empty() {
        println!("\nReports:");
        for path in &outcome.written {
            println!("  - {}", path.display());
        }
    }
    Ok(())
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }

    println!("Diagnostics:");
    for diagnostic in diagnostics {
        let level = match diagnostic.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warn",
        };
        match &diagnostic.location {
            Some(location) => println!("  - [{level}] {location}: {}", diagnostic.message),
            None => println!("  - [{level}] {}", diagnostic.message),
        }
    }
    println!();
}
