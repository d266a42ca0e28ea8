//! Evaluators that turn program and checker runs into one `TestReport` per test.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::SimBoxError;
use crate::options::{AllowedFile, RunOptions};
use crate::report::ExitReport;
use crate::sandbox::MEMORY_LIMIT_EXCEEDED;
use crate::utils::page_size;

pub use checker::{parse_checker_output, CheckerVerdict};
pub use interactive::{test_on_interactive_test, InteractiveTestArgs};
pub use suite::Executable;
pub use test_on_test::{test_on_test, TestArgs};

mod checker;
mod interactive;
mod suite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestStatus {
  OK,
  WrongAnswer,
  TimeLimitExceeded,
  MemoryLimitExceeded,
  OutputSizeLimitExceeded,
  RuntimeError,
  CheckerError,
}

/// Wall time, CPU time and memory of one side of a test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunStats {
  pub runtime: Duration,
  pub cpu_time: Duration,
  pub peak_memory: u64,
}

impl From<&ExitReport> for RunStats {
  fn from(report: &ExitReport) -> Self {
    RunStats {
      runtime: report.runtime,
      cpu_time: report.cpu_runtime,
      peak_memory: report.vm_peak,
    }
  }
}

impl RunStats {
  fn to_json(&self) -> Value {
    json!({
      "time": self.runtime.as_millis() as u64,
      "cpu_time": self.cpu_time.as_millis() as u64,
      "memory": self.peak_memory,
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
  pub status: TestStatus,
  /// In `[0, 1]`
  pub score: f64,
  pub comment: String,
  pub program: Option<RunStats>,
  pub checker: Option<RunStats>,
}

impl TestReport {
  pub(crate) fn new(status: TestStatus, comment: impl Into<String>, score: f64) -> Self {
    TestReport {
      status,
      score,
      comment: comment.into(),
      program: None,
      checker: None,
    }
  }

  pub fn report_human(&self) {
    let color = match self.status {
      TestStatus::OK => 2,
      TestStatus::CheckerError => 3,
      _ => 1,
    };
    println!();
    println!("\x1b[1mStatus\x1b[22m     \x1b[9{}m{:?}\x1b[39m", color, self.status);
    println!("\x1b[1mScore\x1b[22m      {}", self.score);
    if !self.comment.is_empty() {
      println!("\x1b[1mComment\x1b[22m    {}", self.comment);
    }
    for (side, stats) in [("Program", &self.program), ("Checker", &self.checker)] {
      if let Some(stats) = stats {
        println!(
          "\x1b[1m{}\x1b[22m    {} ms, {} ms CPU, {} KB",
          side,
          stats.runtime.as_millis(),
          stats.cpu_time.as_millis(),
          stats.peak_memory / 1024
        );
      }
    }
    println!();
  }

  pub fn to_json(&self) -> Value {
    json!({
      "ok": true,
      "status": self.status,
      "score": self.score,
      "comment": self.comment,
      "program": self.program.map(|stats| stats.to_json()),
      "checker": self.checker.map(|stats| stats.to_json()),
    })
  }
}

/// Limits of the judged program
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramLimits {
  pub time_limit: Duration,
  pub cpu_time_limit: Duration,
  pub memory_limit: u64,
  pub output_size_limit: u64,
}

/// Limits of the checker, including how much of its comment is kept
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerLimits {
  pub time_limit: Duration,
  pub cpu_time_limit: Duration,
  pub memory_limit: u64,
  pub max_comment_len: usize,
}

/// Something that can run a previously built executable
pub trait Suite: Sync {
  /// `args` excludes `argv[0]`
  fn run(
    &self,
    args: &[String],
    options: RunOptions,
    allowed_files: &[AllowedFile],
  ) -> Result<ExitReport, SimBoxError>;
}

/// Options carrying the program limits. The memory limit gets one page of headroom so that
/// going over the limit is observable.
fn program_options(limits: &ProgramLimits) -> RunOptions {
  RunOptions::new()
    .time_limit(limits.time_limit)
    .cpu_time_limit(limits.cpu_time_limit)
    .memory_limit(limits.memory_limit + page_size())
}

fn checker_options(limits: &CheckerLimits) -> RunOptions {
  RunOptions::new()
    .time_limit(limits.time_limit)
    .cpu_time_limit(limits.cpu_time_limit)
    .memory_limit(limits.memory_limit + page_size())
    // First two lines of the verdict fit in the extra bytes
    .max_output_size(limits.max_comment_len as u64 + 32)
}

fn timed_out(report: &ExitReport, time_limit: Duration, cpu_time_limit: Duration) -> bool {
  report.termination.was_killed()
    && (report.runtime >= time_limit || report.cpu_runtime >= cpu_time_limit)
}

fn out_of_memory(report: &ExitReport, memory_limit: u64) -> bool {
  report.vm_peak > memory_limit || report.message.as_deref() == Some(MEMORY_LIMIT_EXCEEDED)
}

/// Verdict for a program that did not finish cleanly, `None` when it did
fn classify_program(report: &ExitReport, limits: &ProgramLimits) -> Option<TestReport> {
  use nix::sys::signal::Signal;

  if timed_out(report, limits.time_limit, limits.cpu_time_limit) {
    return Some(TestReport::new(TestStatus::TimeLimitExceeded, "", 0.0));
  }
  if out_of_memory(report, limits.memory_limit) {
    return Some(TestReport::new(TestStatus::MemoryLimitExceeded, "", 0.0));
  }
  if report.termination.was_killed_by(Signal::SIGXFSZ) {
    return Some(TestReport::new(TestStatus::OutputSizeLimitExceeded, "", 0.0));
  }
  if !report.is_success() {
    return Some(TestReport::new(
      TestStatus::RuntimeError,
      format!("Runtime error: {}", report.description()),
      0.0,
    ));
  }
  None
}

/// Same as `classify_program`, but every failure is the checker's
fn classify_checker(report: &ExitReport, limits: &CheckerLimits) -> Option<TestReport> {
  let comment = if timed_out(report, limits.time_limit, limits.cpu_time_limit) {
    "Checker error: time limit exceeded".to_string()
  } else if out_of_memory(report, limits.memory_limit) {
    "Checker error: memory limit exceeded".to_string()
  } else if !report.is_success() {
    format!("Checker runtime error: {}", report.description())
  } else {
    return None;
  };
  Some(TestReport::new(TestStatus::CheckerError, comment, 0.0))
}
