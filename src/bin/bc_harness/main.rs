//! Command-line harness driving a simulated MIL-STD-1553B bus controller.
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use milstd1553b_bc::BcError;
use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

mod script;

use script::{Harness, UsageError};

const DEMO_SCRIPT: &str = include_str!("../../../demos/receive_sequence.bcs");

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "MIL-STD-1553B bus controller harness",
    long_about = None
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a harness script from a file, or from stdin when omitted.
    Run {
        #[arg(value_name = "SCRIPT")]
        script: Option<PathBuf>,
    },
    /// Run the reference receive sequence: one RT->BC message in a 100 ms major frame.
    Demo,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .with(subscriber_fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn read_script(path: Option<PathBuf>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read script {}", path.display())),
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("failed to read script from stdin")?;
            Ok(text)
        }
    }
}

fn execute(command: Commands) -> Result<()> {
    let script = match command {
        Commands::Run { script } => read_script(script)?,
        Commands::Demo => DEMO_SCRIPT.to_owned(),
    };
    Harness::stdout().run_script(&script)
}

fn report(err: &anyhow::Error) -> ExitCode {
    if let Some(usage) = err.downcast_ref::<UsageError>() {
        eprintln!("error: {}", usage);
        return ExitCode::from(2);
    }
    match err.downcast_ref::<BcError>() {
        Some(bc) => eprintln!("error: {}: {:#}", bc.kind(), err),
        None => eprintln!("error: {:#}", err),
    }
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}
