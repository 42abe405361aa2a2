//! # strand-shell
//!
//! A shell pipeline engine. A command line — commands joined by `|`, `&&`,
//! `||`, with output redirection, backgrounding, and the `cd`/`exit`
//! builtins — is parsed into an expression stream, compiled into an
//! arena-allocated execution graph, and run over forked processes and
//! pipes.
//!
//! ```text
//! line ──parse──▶ CommandLine ──build──▶ Graph ──execute──▶ Outcome
//! ```

pub mod exec;
pub mod graph;
pub mod parse;

pub use exec::{reap_zombies, ExecError, Outcome};
pub use graph::{build, BuildError, Graph};
pub use parse::{parse_line, CommandLine, ParseError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Parse, compile, and run one line, then reap any finished background
/// children. `Ok(None)` means the line was blank or comment-only.
pub fn run_line(line: &str, dedup: bool) -> Result<Option<Outcome>, ShellError> {
    let Some(parsed) = parse_line(line)? else {
        return Ok(None);
    };
    let graph = build(&parsed, dedup)?;
    let outcome = graph.execute()?;
    reap_zombies();
    Ok(Some(outcome))
}
