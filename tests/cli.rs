//! End-to-end tests of the runbook binary

mod common;

use assert_cmd::Command;
use common::create_test_config;
use predicates::prelude::*;

const RUNBOOK: &str = r#"
tasks:
  hello:
    desc: Say hello
    run: echo hello from runbook
  greet:ci:
    run: echo hello ci
  fail:
    run: |
      echo going down >&2
      exit 7
  slow:
    run: sleep 5
  loop-a: { run: echo a, needs: loop-b }
  loop-b: { run: echo b, needs: loop-a }
jobs:
  ci:
    desc: Continuous integration
    steps: [hello]
"#;

fn runbook() -> Command {
    Command::cargo_bin("runbook").unwrap()
}

#[test]
fn test_list_tasks() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .arg("--list")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("Say hello"))
        .stdout(predicate::str::contains("greet"))
        .stdout(predicate::str::contains("Continuous integration"));
}

#[test]
fn test_run_task_succeeds() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .arg("hello")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("hello from runbook"));
}

#[test]
fn test_quiet_hides_task_output() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .args(["-q", "hello"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("hello from runbook").not());
}

#[test]
fn test_context_flag_routes_override() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .args(["-c", "ci", "greet"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("hello ci"));
}

#[test]
fn test_failed_task_exits_one() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .arg("fail")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("RuntimeExecError"))
        .stderr(predicate::str::contains("going down"));
}

#[test]
fn test_timeout_exits_124() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .args(["--timeout", "200ms", "slow"])
        .assert()
        .code(124)
        .stderr(predicate::str::contains("TimeoutError"));
}

#[test]
fn test_unknown_task_exits_two() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .arg("nope")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("'nope' is not defined"));
}

#[test]
fn test_cycle_exits_two() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .arg("loop-a")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Circular dependency"));
}

#[test]
fn test_invalid_config_exits_two() {
    let (dir, _path) = create_test_config("tasks:\n  a: { run: x, needs: ghost }\n");

    runbook()
        .current_dir(dir.path())
        .arg("a")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn test_file_flag_from_another_directory() {
    let (_dir, path) = create_test_config(RUNBOOK);
    let elsewhere = tempfile::TempDir::new().unwrap();

    runbook()
        .current_dir(elsewhere.path())
        .arg("-f")
        .arg(&path)
        .arg("hello")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("hello from runbook"));
}

#[test]
fn test_job_flag() {
    let (dir, _path) = create_test_config(RUNBOOK);

    runbook()
        .current_dir(dir.path())
        .args(["--job", "ci"])
        .assert()
        .code(0)
        .stderr(predicate::str::contains("job ci succeeded"));
}

#[test]
fn test_completions() {
    runbook()
        .args(["--completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("runbook"));
}
