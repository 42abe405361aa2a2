//! End-to-end tests against the built `strand-sh` binary.

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

use tempfile::TempDir;

fn strand_sh() -> Command {
    Command::new(env!("CARGO_BIN_EXE_strand-sh"))
}

fn run_script_on_stdin(script: &str) -> std::process::Output {
    let mut child = strand_sh()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn strand-sh");
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(script.as_bytes())
        .unwrap();
    child.wait_with_output().expect("wait for strand-sh")
}

#[test]
fn branch_chain_prints_both_rescued_and_chained_output() {
    let output = run_script_on_stdin("false || echo a && echo b\n");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "a\nb\n");
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn exit_builtin_sets_the_process_exit_code() {
    let output = run_script_on_stdin("echo before\nexit 5\necho after\n");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "before\n");
    assert_eq!(output.status.code(), Some(5));
}

#[test]
fn last_line_exit_code_is_the_process_exit_code() {
    let output = run_script_on_stdin("true\nfalse\n");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn parse_errors_are_reported_and_the_line_is_skipped() {
    let output = run_script_on_stdin("echo ok\n| broken\necho still-ok\n");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ok\nstill-ok\n");
    assert!(String::from_utf8_lossy(&output.stderr).contains("strand-sh:"));
}

#[test]
fn runs_a_script_file() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("script.sh");
    let out_file = dir.path().join("result.txt");
    fs::write(
        &script,
        format!("echo scripted > {}\n", out_file.to_str().unwrap()),
    )
    .unwrap();

    let status = strand_sh().arg(&script).status().expect("run strand-sh");
    assert_eq!(status.code(), Some(0));
    assert_eq!(fs::read_to_string(&out_file).unwrap(), "scripted\n");
}

#[test]
fn cd_affects_later_lines_in_the_same_session() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().canonicalize().unwrap();
    let output = run_script_on_stdin(&format!("cd {}\npwd\n", target.display()));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim_end(),
        target.display().to_string()
    );
}
