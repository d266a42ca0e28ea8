use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::info;
use nix::sys::signal::Signal;
use tempfile::{tempdir, TempDir};

use simbox::{
  AllowedFile, ExitReport, OpenAccess, RunOptions, Sandbox, Stdio, Termination,
  MEMORY_LIMIT_EXCEEDED,
};

mod common;

fn prepare(name: &str) -> Option<(TempDir, PathBuf)> {
  common::setup();
  let dir = tempdir().unwrap();
  let executable = common::compile_fixture(dir.path(), name)?;
  Some((dir, executable))
}

fn limited() -> RunOptions {
  RunOptions::new()
    .time_limit(Duration::from_secs(5))
    .cpu_time_limit(Duration::from_secs(5))
    .memory_limit(256 << 20)
}

#[test]
fn it_should_run_aplusb() {
  let Some((dir, executable)) = prepare("aplusb") else {
    return;
  };

  for i in 1..4 {
    let sub_in = common::fixture(&format!("aplusb/{}.in", i));
    let sub_out = dir.path().join("sub.out");
    let options = limited()
      .stdin(Stdio::file(File::open(&sub_in).unwrap()))
      .stdout(Stdio::file(File::create(&sub_out).unwrap()));
    let report = Sandbox::new().run(&executable, &[], options, &[]).unwrap();
    assert_eq!(report.termination, Termination::Exited(0), "{:?}", report);
    assert_eq!(report.message, None);
    assert!(report.vm_peak > 0);

    let out = fs::read_to_string(&sub_out).unwrap();
    let ans = fs::read_to_string(common::fixture(&format!("aplusb/{}.ans", i))).unwrap();
    info!("Testcase #{}. out: {}", i, out.trim_end());
    assert_eq!(out, ans);
  }
}

#[test]
fn forbidden_syscall_kills() {
  let Some((_dir, executable)) = prepare("forbidden") else {
    return;
  };

  let report = Sandbox::new().run(&executable, &[], limited(), &[]).unwrap();
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some("forbidden syscall: mkdir"));
}

#[test]
fn denied_syscall_fails_without_kill() {
  let Some((dir, executable)) = prepare("fork") else {
    return;
  };

  let options = limited().stderr(Stdio::file(File::create(dir.path().join("err")).unwrap()));
  let report = Sandbox::new().run(&executable, &[], options, &[]).unwrap();
  assert_eq!(report.termination, Termination::Exited(2));
  assert_eq!(report.message, None);
  let err = fs::read_to_string(dir.path().join("err")).unwrap();
  assert_eq!(err, "fork: Operation not permitted\n");
}

#[test]
fn open_only_allowed_files() {
  let Some((dir, executable)) = prepare("open_file") else {
    return;
  };

  let readable = dir.path().join("readable.txt");
  let writable = dir.path().join("writable.txt");
  let hidden = dir.path().join("hidden.txt");
  for path in [&readable, &writable, &hidden] {
    fs::write(path, "content").unwrap();
  }
  let args = [&readable, &writable, &hidden]
    .iter()
    .map(|path| path.to_string_lossy().to_string())
    .collect::<Vec<String>>();
  let allowed_files = [
    AllowedFile::read_only(&readable),
    AllowedFile::new(&writable, OpenAccess::WriteOnly),
  ];

  let sub_out = dir.path().join("sub.out");
  let options = limited().stdout(Stdio::file(File::create(&sub_out).unwrap()));
  let report = Sandbox::new()
    .run(&executable, &args, options, &allowed_files)
    .unwrap();
  assert_eq!(report.termination, Termination::Exited(0), "{:?}", report);

  let out = fs::read_to_string(&sub_out).unwrap();
  assert_eq!(
    out,
    format!(
      "{}: read 7\n{}: Operation not permitted\n{}: Operation not permitted\n",
      args[0], args[1], args[2]
    )
  );
}

#[test]
fn closed_stdin_reads_fail() {
  let Some((_dir, executable)) = prepare("aplusb") else {
    return;
  };

  let options = limited().stdin(Stdio::Close).stdout(Stdio::Close);
  let report = Sandbox::new().run(&executable, &[], options, &[]).unwrap();
  assert_eq!(report.termination, Termination::Exited(1));
  assert_eq!(report.message, None);
}

#[test]
fn failed_allocation_is_memory_limit_exceeded() {
  let Some((_dir, executable)) = prepare("memory") else {
    return;
  };

  let options = limited().memory_limit(64 << 20);
  let report = Sandbox::new().run(&executable, &[], options, &[]).unwrap();
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some(MEMORY_LIMIT_EXCEEDED));
  assert!(report.vm_peak > 32 << 20);
  assert!(report.vm_peak <= 64 << 20);
}

#[test]
fn wall_time_limit_kills() {
  let Some((_dir, executable)) = prepare("spin") else {
    return;
  };

  let options = RunOptions::new().time_limit(Duration::from_millis(300));
  let report = Sandbox::new().run(&executable, &[], options, &[]).unwrap();
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert!(report.runtime >= Duration::from_millis(300));
  assert!(report.runtime < Duration::from_secs(3));
  assert_eq!(report.message, None);
}

#[test]
fn cpu_time_limit_kills() {
  let Some((_dir, executable)) = prepare("spin") else {
    return;
  };

  let options = RunOptions::new()
    .time_limit(Duration::from_secs(5))
    .cpu_time_limit(Duration::from_millis(200));
  let report = Sandbox::new().run(&executable, &[], options, &[]).unwrap();
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert!(report.cpu_runtime >= Duration::from_millis(150));
  assert!(report.runtime < Duration::from_secs(5));
}

/// Timers start once the program image is in place, so fork and filter setup are not charged
#[test]
fn runtime_is_measured_from_exec() {
  let Some((_dir, executable)) = prepare("quick") else {
    return;
  };

  let started = Instant::now();
  let report = Sandbox::new().run(&executable, &[], limited(), &[]).unwrap();
  let elapsed = started.elapsed();
  assert_eq!(report.termination, Termination::Exited(7));
  assert!(report.runtime <= elapsed);
  assert!(report.runtime < Duration::from_secs(1));
  assert!(report.vm_peak > 0);
}

#[test]
fn missing_executable_is_reported() {
  common::setup();

  let report = Sandbox::new()
    .run(&PathBuf::from("/definitely/not/here"), &[], limited(), &[])
    .unwrap();
  assert!(!report.termination.is_success());
  // never reached exec, so the timers were never armed
  assert_eq!(report.runtime, Duration::ZERO);
  assert_eq!(
    report.message.as_deref(),
    Some("execve: No such file or directory")
  );
}

/// Run with stdout captured into a file in `dir`
fn run_captured(
  dir: &TempDir,
  executable: &Path,
  args: &[&str],
  allowed_files: &[AllowedFile],
) -> (ExitReport, String) {
  let sub_out = dir.path().join("sub.out");
  let options = limited().stdout(Stdio::file(File::create(&sub_out).unwrap()));
  let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<String>>();
  let report = Sandbox::new()
    .run(executable, &args, options, allowed_files)
    .unwrap();
  let out = fs::read_to_string(&sub_out).unwrap();
  info!("{:?} -> {:?}", report, out);
  (report, out)
}

#[test]
fn second_execve_is_forbidden() {
  let Some((dir, executable)) = prepare("execve_twice") else {
    return;
  };

  let (report, _) = run_captured(&dir, &executable, &[], &[]);
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some("forbidden syscall: execve"));
}

#[test]
fn readlink_fails_and_ends_startup() {
  let Some((dir, executable)) = prepare("startup") else {
    return;
  };

  let (report, out) = run_captured(&dir, &executable, &["readlink", "uname"], &[]);
  assert_eq!(out, "readlink: No such file or directory\n");
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some("forbidden syscall: uname"));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn arch_prctl_is_forbidden_after_startup() {
  let Some((dir, executable)) = prepare("startup") else {
    return;
  };

  let (report, out) = run_captured(&dir, &executable, &["readlink", "arch_prctl"], &[]);
  assert_eq!(out, "readlink: No such file or directory\n");
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some("forbidden syscall: arch_prctl"));
}

#[test]
fn third_prlimit_is_forbidden() {
  let Some((dir, executable)) = prepare("prlimit") else {
    return;
  };

  // libc may spend one call of its own during startup
  let (report, out) = run_captured(&dir, &executable, &[], &[]);
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some("forbidden syscall: prlimit64"));
  let calls = out.lines().collect::<Vec<&str>>();
  assert!(!calls.is_empty() && calls.len() <= 2, "{:?}", calls);
  assert!(calls.iter().all(|line| *line == "ok"));
}

#[test]
fn signals_only_reach_the_program_itself() {
  let Some((dir, executable)) = prepare("kill") else {
    return;
  };

  let (report, out) = run_captured(&dir, &executable, &[], &[]);
  assert_eq!(report.termination, Termination::Exited(0), "{:?}", report);
  assert_eq!(
    out,
    "kill parent: Operation not permitted\n\
     kill init: Operation not permitted\n\
     tgkill parent: Operation not permitted\n\
     tgkill mixed: Operation not permitted\n\
     kill self: ok\n\
     tgkill self: ok\n"
  );
}

#[test]
fn i386_syscalls_are_filtered_too() {
  let Some((dir, executable)) = prepare("int80") else {
    return;
  };

  let (report, out) = run_captured(&dir, &executable, &[], &[]);
  assert_eq!(out, "i386 getpid: same\n");
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some("forbidden syscall: mkdir"));
}

#[test]
fn spinning_on_memory_syscalls_is_memory_limit_exceeded() {
  let Some((dir, executable)) = prepare("vm_spin") else {
    return;
  };

  let (report, _) = run_captured(&dir, &executable, &[], &[]);
  assert!(report.termination.was_killed_by(Signal::SIGKILL));
  assert_eq!(report.message.as_deref(), Some(MEMORY_LIMIT_EXCEEDED));
}

#[test]
fn openat_needs_the_working_directory() {
  let Some((dir, executable)) = prepare("openat_dirfd") else {
    return;
  };

  let readable = dir.path().join("readable.txt");
  fs::write(&readable, "content").unwrap();
  let path = readable.to_string_lossy().to_string();
  let (report, out) = run_captured(
    &dir,
    &executable,
    &[path.as_str()],
    &[AllowedFile::read_only(&readable)],
  );
  assert_eq!(report.termination, Termination::Exited(0), "{:?}", report);
  assert_eq!(out, "cwd: ok\nstdin: Operation not permitted\n");
}

#[test]
fn unreadable_paths_fail_without_kill() {
  let Some((dir, executable)) = prepare("bad_path") else {
    return;
  };

  let (report, out) = run_captured(&dir, &executable, &[], &[]);
  assert_eq!(report.termination, Termination::Exited(0), "{:?}", report);
  assert_eq!(report.message, None);
  assert_eq!(out, "long: File name too long\nbad: Bad address\n");
}

#[test]
fn after_fork_sees_the_tracee() {
  let Some((_dir, executable)) = prepare("quick") else {
    return;
  };

  let mut seen = None;
  let report = Sandbox::new()
    .run_with(&executable, &[], limited(), &[], |pid| seen = Some(pid))
    .unwrap();
  assert_eq!(report.termination, Termination::Exited(7));
  assert!(seen.map(|pid| pid.as_raw() > 0).unwrap_or(false));
}
