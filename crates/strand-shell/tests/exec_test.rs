//! Process-level execution tests. Serialized by a lock: the engine reaps
//! with `waitpid(-1)` and `cd` moves the process-wide cwd, so concurrent
//! tests would interfere through shared process state.

use std::fs;
use std::sync::Mutex;

use tempfile::TempDir;

use strand_shell::run_line;

static EXEC_LOCK: Mutex<()> = Mutex::new(());

fn locked() -> std::sync::MutexGuard<'static, ()> {
    EXEC_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn exit_codes_pass_through() {
    let _guard = locked();
    assert_eq!(run_line("true", true).unwrap().unwrap().code, 0);
    assert_eq!(run_line("false", true).unwrap().unwrap().code, 1);
}

#[test]
fn unknown_command_exits_nonzero() {
    let _guard = locked();
    let outcome = run_line("definitely-not-a-command-zz", true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 1);
}

#[test]
fn blank_lines_do_nothing() {
    let _guard = locked();
    assert!(run_line("", true).unwrap().is_none());
    assert!(run_line("# comment", true).unwrap().is_none());
}

#[test]
fn redirection_truncates_and_appends() {
    let _guard = locked();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("out.txt");
    let target = target.to_str().unwrap();

    run_line(&format!("echo first > {target}"), true).unwrap();
    assert_eq!(fs::read_to_string(target).unwrap(), "first\n");

    run_line(&format!("echo second > {target}"), true).unwrap();
    assert_eq!(fs::read_to_string(target).unwrap(), "second\n");

    run_line(&format!("echo third >> {target}"), true).unwrap();
    assert_eq!(fs::read_to_string(target).unwrap(), "second\nthird\n");
}

#[test]
fn pipeline_feeds_left_stdout_into_right_stdin() {
    let _guard = locked();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("grepped.txt");
    let target = target.to_str().unwrap();

    let outcome = run_line(
        &format!("printf 'one\\ntwo\\nthree\\n' | grep t > {target}"),
        true,
    )
    .unwrap()
    .unwrap();
    assert_eq!(outcome.code, 0);
    assert_eq!(fs::read_to_string(target).unwrap(), "two\nthree\n");
}

#[test]
fn three_stage_pipeline_exit_code_is_the_last_stage() {
    let _guard = locked();
    let outcome = run_line("echo x | grep x | true", true).unwrap().unwrap();
    assert_eq!(outcome.code, 0);

    let outcome = run_line("echo x | grep x | false", true).unwrap().unwrap();
    assert_eq!(outcome.code, 1);
}

#[test]
fn and_runs_right_only_on_success() {
    let _guard = locked();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let marker_str = marker.to_str().unwrap();

    let outcome = run_line(&format!("false && echo never > {marker_str}"), true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 1);
    assert!(!marker.exists());

    let outcome = run_line(&format!("true && echo always > {marker_str}"), true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 0);
    assert!(marker.exists());
}

#[test]
fn or_runs_right_only_on_failure() {
    let _guard = locked();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let marker_str = marker.to_str().unwrap();

    let outcome = run_line(&format!("true || echo never > {marker_str}"), true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 0);
    assert!(!marker.exists());

    run_line(&format!("false || echo rescued > {marker_str}"), true)
        .unwrap()
        .unwrap();
    assert!(marker.exists());
}

#[test]
fn chained_branches_evaluate_left_to_right() {
    let _guard = locked();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("chain.txt");
    let target_str = target.to_str().unwrap();

    // `false || echo a && echo b`: both echoes run, the line exits 0. The
    // redirection belongs to the final command only.
    let outcome = run_line(&format!("false || true && echo b > {target_str}"), true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 0);
    assert_eq!(fs::read_to_string(&target).unwrap(), "b\n");
}

#[test]
fn exit_builtin_terminates_with_its_argument() {
    let _guard = locked();
    let outcome = run_line("exit 7", true).unwrap().unwrap();
    assert_eq!(outcome.code, 7);
    assert!(outcome.exit_called);

    let outcome = run_line("exit", true).unwrap().unwrap();
    assert_eq!(outcome.code, 0);
    assert!(outcome.exit_called);
}

/// A pipe never propagates the exit builtin: the terminal `exit` runs in a
/// forked leg, so its code comes back but the interpreter keeps going.
#[test]
fn exit_inside_a_pipeline_does_not_terminate_the_interpreter() {
    let _guard = locked();
    let outcome = run_line("true | exit 3", true).unwrap().unwrap();
    assert_eq!(outcome.code, 3);
    assert!(!outcome.exit_called);
}

#[test]
fn exit_after_branch_propagates_through_the_tree() {
    let _guard = locked();
    let outcome = run_line("true && exit 9", true).unwrap().unwrap();
    assert_eq!(outcome.code, 9);
    assert!(outcome.exit_called);

    // The skipped leg's exit never runs.
    let outcome = run_line("false && exit 9", true).unwrap().unwrap();
    assert_eq!(outcome.code, 1);
    assert!(!outcome.exit_called);
}

#[test]
fn cd_builtin_changes_the_shell_directory() {
    let _guard = locked();
    let original = std::env::current_dir().unwrap();
    let dir = TempDir::new().unwrap();
    let target = dir.path().canonicalize().unwrap();

    let outcome = run_line(&format!("cd {}", target.display()), true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 0);
    assert_eq!(std::env::current_dir().unwrap(), target);

    let outcome = run_line("cd /definitely/not/a/directory", true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 1);

    std::env::set_current_dir(original).unwrap();
}

#[test]
fn background_command_returns_immediately_with_success() {
    let _guard = locked();
    let outcome = run_line("sleep 1 &", true).unwrap().unwrap();
    assert_eq!(outcome.code, 0);
    assert!(!outcome.exit_called);
}

#[test]
fn deduped_pipeline_still_produces_the_right_output() {
    let _guard = locked();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("dedup.txt");
    let target_str = target.to_str().unwrap();

    // The second of the three `cat` stages is suppressed; the data still
    // flows through unchanged.
    let outcome = run_line(&format!("echo data | cat | cat | cat > {target_str}"), true)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.code, 0);
    assert_eq!(fs::read_to_string(&target).unwrap(), "data\n");
}
