//! Runs a compiled [`Graph`] over OS processes.
//!
//! Commands fork and `execvp`; pipes fork one child per leg with the pipe
//! ends dup2'd over stdin/stdout. Every fd is closed by the parent and by
//! any child that does not use it, otherwise downstream reads never see
//! EOF. Branch legs run sequentially in the shell process itself.

use std::ffi::CString;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::Path;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, dup2, execvp, fork, pipe, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::graph::{Command, Graph, Node, NodeId};
use crate::parse::OutMode;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// A branch reached execution with no right leg.
    #[error("branch node is incomplete")]
    IncompleteBranch,

    #[error("command name contains a NUL byte")]
    BadCommandName(#[from] std::ffi::NulError),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// What one graph execution produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub code: i32,
    /// The `exit` builtin ran; the interpreter loop should terminate with
    /// `code`.
    pub exit_called: bool,
}

impl Outcome {
    fn plain(code: i32) -> Self {
        Self {
            code,
            exit_called: false,
        }
    }
}

impl Graph {
    /// Execute the graph and return the line's exit outcome.
    pub fn execute(&self) -> Result<Outcome> {
        self.exec_node(self.root(), None, None)
    }

    fn exec_node(
        &self,
        id: NodeId,
        read_fd: Option<RawFd>,
        write_fd: Option<RawFd>,
    ) -> Result<Outcome> {
        match self.node(id) {
            Node::Command(command) => exec_command(command, read_fd, write_fd),
            Node::Pipe { left, right } => self.exec_pipe(*left, *right, read_fd, write_fd),
            Node::Branch {
                left,
                execute_on_fail,
                right,
            } => self.exec_branch(*left, *execute_on_fail, *right),
        }
    }

    /// One pipe stage: a child per leg, the write end feeding the left leg's
    /// stdout into the right leg's stdin. The exit code is the right leg's.
    fn exec_pipe(
        &self,
        left: NodeId,
        right: NodeId,
        read_fd: Option<RawFd>,
        write_fd: Option<RawFd>,
    ) -> Result<Outcome> {
        let (pipe_rd, pipe_wr) = pipe()?;
        let (pipe_rd, pipe_wr) = (pipe_rd.into_raw_fd(), pipe_wr.into_raw_fd());

        let left_fork = unsafe { fork() }?;
        let left_pid = match left_fork {
            ForkResult::Child => {
                let _ = close(pipe_rd);
                let code = match self.exec_node(left, read_fd, Some(pipe_wr)) {
                    Ok(outcome) => outcome.code,
                    Err(_) => 1,
                };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => child,
        };
        let right_fork = unsafe { fork() }?;
        let right_pid = match right_fork {
            ForkResult::Child => {
                let _ = close(pipe_wr);
                let code = match self.exec_node(right, Some(pipe_rd), write_fd) {
                    Ok(outcome) => outcome.code,
                    Err(_) => 1,
                };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => child,
        };

        let _ = close(pipe_rd);
        let _ = close(pipe_wr);
        trace!(left = %left_pid, right = %right_pid, "pipe stage forked");

        let _ = waitpid(left_pid, None);
        let code = match waitpid(right_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            _ => 0,
        };
        // A pipe never propagates the exit builtin: `exit` refuses to run
        // with a pipeline writing into it, and the legs are separate
        // processes anyway.
        Ok(Outcome::plain(code))
    }

    fn exec_branch(
        &self,
        left: NodeId,
        execute_on_fail: bool,
        right: Option<NodeId>,
    ) -> Result<Outcome> {
        debug_assert!(right.is_some(), "builder left a branch incomplete");
        let right = right.ok_or(ExecError::IncompleteBranch)?;

        let left_outcome = self.exec_node(left, None, None)?;
        if left_outcome.exit_called {
            return Ok(left_outcome);
        }
        let take_right = (left_outcome.code == 0) != execute_on_fail;
        if take_right {
            self.exec_node(right, None, None)
        } else {
            Ok(left_outcome)
        }
    }
}

fn exec_command(
    command: &Command,
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
) -> Result<Outcome> {
    if command.cmd.exe == "cd" {
        return Ok(Outcome::plain(builtin_cd(command)));
    }
    // `exit` only terminates the interpreter when nothing pipes into it.
    if command.cmd.exe == "exit" && write_fd.is_none() {
        let code = command
            .cmd
            .args
            .first()
            .and_then(|arg| arg.parse().ok())
            .unwrap_or(0);
        return Ok(Outcome {
            code,
            exit_called: true,
        });
    }

    let fork_result = unsafe { fork() }?;
    match fork_result {
        ForkResult::Child => {
            if let Some(fd) = read_fd {
                let _ = dup2(fd, libc::STDIN_FILENO);
                let _ = close(fd);
            }
            if let Some(fd) = write_fd {
                let _ = dup2(fd, libc::STDOUT_FILENO);
                let _ = close(fd);
            }
            if command.out_mode != OutMode::Stdout {
                redirect_stdout_to_file(command);
            }
            match argv(command) {
                Ok((exe, args)) => {
                    let _ = execvp(&exe, &args);
                }
                Err(_) => {}
            }
            // exec failed; nothing sane to do in the forked child.
            unsafe { libc::_exit(1) };
        }
        ForkResult::Parent { child } => {
            if let Some(fd) = read_fd {
                let _ = close(fd);
            }
            if let Some(fd) = write_fd {
                let _ = close(fd);
            }
            if command.background {
                debug!(pid = %child, exe = %command.cmd.exe, "running in background");
                let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
                return Ok(Outcome::plain(0));
            }
            let code = match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(status) => {
                    warn!(pid = %child, ?status, "child did not exit normally");
                    1
                }
                Err(_) => 1,
            };
            Ok(Outcome::plain(code))
        }
    }
}

fn builtin_cd(command: &Command) -> i32 {
    match command.cmd.args.first() {
        Some(dir) if chdir(Path::new(dir)).is_ok() => 0,
        _ => 1,
    }
}

/// In the forked child: point stdout at the redirection target.
fn redirect_stdout_to_file(command: &Command) {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let Some(path) = command.out_file.as_deref() else {
        return;
    };
    let mut options = OpenOptions::new();
    options.write(true).create(true).mode(0o700);
    match command.out_mode {
        OutMode::FileNew => options.truncate(true),
        OutMode::FileAppend => options.append(true),
        OutMode::Stdout => unreachable!("checked by the caller"),
    };
    if let Ok(file) = options.open(path) {
        let fd = file.into_raw_fd();
        let _ = dup2(fd, libc::STDOUT_FILENO);
        let _ = close(fd);
    }
}

fn argv(command: &Command) -> std::result::Result<(CString, Vec<CString>), std::ffi::NulError> {
    let exe = CString::new(command.cmd.exe.as_str())?;
    let mut args = Vec::with_capacity(command.cmd.args.len() + 1);
    args.push(exe.clone());
    for arg in &command.cmd.args {
        args.push(CString::new(arg.as_str())?);
    }
    Ok((exe, args))
}

/// Collect any finished background children. Called after every executed
/// line so backgrounded commands do not pile up as zombies.
pub fn reap_zombies() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => trace!(?status, "reaped background child"),
            Err(_) => break,
        }
    }
}
