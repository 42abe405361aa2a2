//! # strand-sh
//!
//! Line-oriented shell driver: reads stdin (or a script file), runs each
//! line through the pipeline engine, and terminates with the `exit`
//! builtin's code or the last line's exit code.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use strand_shell::run_line;

#[derive(Parser)]
#[command(name = "strand-sh")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Script to run instead of reading stdin.
    script: Option<PathBuf>,

    /// Disable the duplicate-filter suppression pass on pure pipelines.
    #[arg(long)]
    no_dedup: bool,

    /// Log filter, e.g. `debug` or `strand_shell=trace`.
    #[arg(long, env = "STRAND_SH_LOG", default_value = "warn")]
    log_level: String,
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let reader: Box<dyn BufRead> = match &cli.script {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut exit_code = 0;
    for line in reader.lines() {
        let line = line.context("read failed")?;
        match run_line(&line, !cli.no_dedup) {
            Ok(Some(outcome)) => {
                exit_code = outcome.code;
                if outcome.exit_called {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                eprintln!("strand-sh: {err}");
            }
        }
    }
    Ok(exit_code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(&cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("strand-sh: {err:#}");
            ExitCode::FAILURE
        }
    }
}
