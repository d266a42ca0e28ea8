//! Program and checker talking over pipes.
//!
//! ```text
//! program stdout --> relay --> checker stdin
//! checker stdout ------------> program stdin
//! ```
//!
//! Whether the checker had decided is read once the program's run returns. A program the
//! evaluator killed because the checker was done always counts as decided.

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, info};
use nix::sys::signal::Signal;

use crate::error::SimBoxError;
use crate::judge::checker::{has_decided, parse_checker_output};
use crate::judge::test_on_test::{absolute, dev_null, read_checker_output};
use crate::judge::{
  checker_options, classify_checker, classify_program, program_options, CheckerLimits,
  ProgramLimits, RunStats, Suite, TestReport,
};
use crate::options::{AllowedFile, KillHandle, Stdio};
use crate::pipe::stream_pipe;

/// One test judged by a checker interacting with the program
pub struct InteractiveTestArgs<'a> {
  pub program: &'a dyn Suite,
  pub checker: &'a dyn Suite,
  pub test_input: &'a Path,
  pub program_limits: ProgramLimits,
  pub checker_limits: CheckerLimits,
}

/// Whether the checker's stderr already starts with a verdict line
fn peek_decided(checker_output: &File) -> bool {
  let mut buf = [0u8; 8];
  match checker_output.read_at(&mut buf, 0) {
    Ok(len) => has_decided(&buf[..len]),
    Err(_) => false,
  }
}

/// Copy program output to the checker until either side closes its end
fn relay(from: OwnedFd, to: OwnedFd) -> Result<(), SimBoxError> {
  let mut from = File::from(from);
  let mut to = File::from(to);
  match io::copy(&mut from, &mut to) {
    Ok(bytes) => {
      debug!("Program closed its output after {} bytes", bytes);
      Ok(())
    }
    Err(err) if err.kind() == ErrorKind::BrokenPipe => {
      debug!("Checker closed its input");
      Ok(())
    }
    Err(err) => Err(err.into()),
  }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
  handle
    .join()
    .unwrap_or_else(|err| std::panic::resume_unwind(err))
}

/// Run program and checker concurrently, wired to each other
pub fn test_on_interactive_test(args: InteractiveTestArgs) -> Result<TestReport, SimBoxError> {
  let test_input = absolute(args.test_input)?;
  let (relay_read, program_stdout) = stream_pipe()?;
  let (checker_stdin, relay_write) = stream_pipe()?;
  let (program_stdin, checker_stdout) = stream_pipe()?;
  let mut checker_output = tempfile::tempfile()?;
  let peek = checker_output.try_clone()?;

  let program_kill = KillHandle::new();
  let checker_finished = AtomicBool::new(false);
  let checker_decided = || checker_finished.load(Ordering::SeqCst) || peek_decided(&peek);

  let checker_run = checker_options(&args.checker_limits)
    .stdin(Stdio::Redirect(checker_stdin))
    .stdout(Stdio::Redirect(checker_stdout))
    .stderr(Stdio::file(checker_output.try_clone()?));
  let program_run = program_options(&args.program_limits)
    .stdin(Stdio::Redirect(program_stdin))
    .stdout(Stdio::Redirect(program_stdout))
    .stderr(dev_null()?)
    .kill_handle(program_kill.clone());
  let checker_args = [test_input.to_string_lossy().to_string()];
  let allowed_files = [AllowedFile::read_only(test_input.clone())];

  info!("Interactive test on {}", test_input.to_string_lossy());
  let (checker, program, relayed) = thread::scope(|scope| {
    let checker_thread = scope.spawn(|| {
      let result = args.checker.run(&checker_args, checker_run, &allowed_files);
      checker_finished.store(true, Ordering::SeqCst);
      // 判定已出，程序没有继续运行的必要
      program_kill.kill();
      result
    });
    let relay_thread = scope.spawn(|| relay(relay_read, relay_write));
    let program_thread = scope.spawn(|| {
      let result = args.program.run(&[], program_run, &[]);
      result.map(|report| (report, checker_decided()))
    });
    (join(checker_thread), join(program_thread), join(relay_thread))
  });
  relayed?;
  let checker = checker?;
  let (program, decided_at_exit) = program?;
  // 评测自己发出的 SIGKILL 不算程序的错
  let killed_by_us =
    program_kill.is_requested() && program.termination.was_killed_by(Signal::SIGKILL);
  let decided = decided_at_exit || killed_by_us;
  debug!("Checker decided before the program ended: {}", decided);

  let with_stats = |mut report: TestReport| {
    report.program = Some(RunStats::from(&program));
    report.checker = Some(RunStats::from(&checker));
    report
  };

  if let Some(report) = classify_program(&program, &args.program_limits) {
    if !decided {
      debug!("Program failed first: {:?}", report.status);
      return Ok(with_stats(report));
    }
  }
  if let Some(report) = classify_checker(&checker, &args.checker_limits) {
    return Ok(with_stats(report));
  }
  let output = read_checker_output(&mut checker_output)?;
  let verdict = parse_checker_output(&output, args.checker_limits.max_comment_len);
  debug!("Checker verdict: {:?}", verdict.status);
  Ok(with_stats(verdict.into()))
}
