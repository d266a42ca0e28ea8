use std::fs;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use simbox::{
  test_on_interactive_test, CheckerLimits, InteractiveTestArgs, ProgramLimits, TestReport,
  TestStatus,
};

mod common;

/// Sends the number from the test input and expects it doubled
const DOUBLER_CHECKER: &str = r#"read n < "$1"
echo "$n"
read ans
if [ "$ans" = "$((n * 2))" ]; then
  printf 'OK\n' >&2
else
  printf 'WRONG\n\nexpected %s, found %s\n' "$((n * 2))" "$ans" >&2
fi"#;

fn judge_with(program: &str, checker: &str, program_limits: ProgramLimits) -> TestReport {
  common::setup();
  let dir = tempdir().unwrap();
  let program = common::script(dir.path(), "program.sh", program);
  let checker = common::script(dir.path(), "checker.sh", checker);
  let test_input = dir.path().join("test.in");
  fs::write(&test_input, "21\n").unwrap();

  test_on_interactive_test(InteractiveTestArgs {
    program: &program,
    checker: &checker,
    test_input: &test_input,
    program_limits,
    checker_limits: CheckerLimits {
      time_limit: Duration::from_secs(10),
      cpu_time_limit: Duration::from_secs(10),
      memory_limit: 256 << 20,
      max_comment_len: 512,
    },
  })
  .unwrap()
}

fn program_limits(time_limit: Duration) -> ProgramLimits {
  ProgramLimits {
    time_limit,
    cpu_time_limit: time_limit,
    memory_limit: 256 << 20,
    output_size_limit: 1 << 20,
  }
}

fn judge(program: &str, checker: &str) -> TestReport {
  judge_with(program, checker, program_limits(Duration::from_secs(5)))
}

#[test]
fn accepted() {
  let report = judge("read n; echo $((n * 2))", DOUBLER_CHECKER);
  assert_eq!(report.status, TestStatus::OK);
  assert_eq!(report.score, 1.0);
  assert_eq!(report.comment, "");
  assert!(report.program.is_some());
  assert!(report.checker.is_some());
}

#[test]
fn wrong_answer() {
  let report = judge("read n; echo $((n + 2))", DOUBLER_CHECKER);
  assert_eq!(report.status, TestStatus::WrongAnswer);
  assert_eq!(report.comment, "expected 42, found 23\n");
}

#[test]
fn program_timeout_after_checker_decided() {
  let report = judge_with(
    "while :; do :; done",
    "printf 'WRONG\\n\\nabc' >&2; sleep 2",
    program_limits(Duration::from_millis(500)),
  );
  assert_eq!(report.status, TestStatus::WrongAnswer);
  assert_eq!(report.comment, "abc");
  assert_eq!(report.score, 0.0);
}

/// Gives up as soon as the program's output ends without an answer
const NO_ANSWER_CHECKER: &str = r#"read n < "$1"
echo "$n"
read ans
printf 'WRONG\n\nno answer' >&2"#;

#[test]
fn closed_output_while_running_is_wrong_answer() {
  let started = Instant::now();
  let report = judge("exec 1>&-; while :; do :; done", NO_ANSWER_CHECKER);
  assert_eq!(report.status, TestStatus::WrongAnswer);
  assert_eq!(report.comment, "no answer");
  assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn crash_after_closed_output_and_verdict_is_wrong_answer() {
  let report = judge(
    "exec 1>&-; sleep 1; exit 1",
    &format!("{}\nsleep 2", NO_ANSWER_CHECKER),
  );
  assert_eq!(report.status, TestStatus::WrongAnswer);
  assert_eq!(report.comment, "no answer");
}

#[test]
fn checker_writes_after_program_exited() {
  let report = judge("exit 0", "sleep 1; echo 42");
  assert_eq!(report.status, TestStatus::CheckerError);
  assert_eq!(
    report.comment,
    "Checker runtime error: killed by signal PIPE - Broken pipe"
  );
}

#[test]
fn program_failing_first_is_blamed() {
  let report = judge("exit 1", "sleep 1; printf 'OK\\n' >&2");
  assert_eq!(report.status, TestStatus::RuntimeError);
  assert_eq!(report.comment, "Runtime error: exited with 1");
}

#[test]
fn program_is_stopped_once_checker_finished() {
  let started = Instant::now();
  let report = judge_with(
    "while :; do :; done",
    "printf 'OK\\n' >&2",
    program_limits(Duration::from_secs(20)),
  );
  assert_eq!(report.status, TestStatus::OK);
  assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn checker_failure_after_program_success() {
  let report = judge("read n; echo $((n * 2))", "read n < \"$1\"; echo \"$n\"; read ans; exit 3");
  assert_eq!(report.status, TestStatus::CheckerError);
  assert_eq!(report.comment, "Checker runtime error: exited with 3");
}
