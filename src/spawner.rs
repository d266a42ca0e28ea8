use std::ffi::CString;
use std::os::unix::prelude::RawFd;
use std::path::Path;
use std::time::Duration;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc::{self, RLIM_INFINITY};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{
  kill, raise, signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, dup2, execve, fork, ForkResult, Pid};

use crate::error::SimBoxError;
use crate::options::{KillHandle, RunOptions, Stdio};
use crate::pipe::{SimBoxPipe, SimBoxWritePipe};
use crate::report::{ExitReport, Termination};
use crate::timer::Timer;
use crate::utils::{into_c_string, wait_child, ChildUsage};

#[derive(Debug, Clone, Copy)]
enum StdioPlan {
  Inherit,
  Close,
  Dup(RawFd),
}

/// Everything the child needs, prepared before `fork` so the child never allocates
pub(crate) struct ChildImage {
  executable: CString,
  argv: Vec<CString>,
  envp: Vec<CString>,
  working_directory: Option<CString>,
  stdio: [StdioPlan; 3],
  memory_limit: Option<u64>,
  cpu_backstop: Option<u64>,
  max_output_size: Option<u64>,
}

impl ChildImage {
  /// `argv[0]` is the executable path itself, followed by `args`
  pub(crate) fn new(
    executable: &Path,
    args: &[String],
    options: &RunOptions,
  ) -> Result<Self, SimBoxError> {
    let executable = into_c_string(executable.to_string_lossy())?;
    let mut argv = vec![executable.clone()];
    for arg in args {
      argv.push(into_c_string(arg)?);
    }
    let envp = options
      .get_env()
      .iter()
      .map(|(key, value)| into_c_string(format!("{}={}", key, value)))
      .collect::<Result<Vec<CString>, SimBoxError>>()?;

    let limits = options.get_limits();
    let working_directory = if limits.working_directory.as_os_str() == "." {
      None
    } else {
      Some(into_c_string(limits.working_directory.to_string_lossy())?)
    };

    let stdio = options.stdio().map(|stdio| match stdio {
      Stdio::Inherit => StdioPlan::Inherit,
      Stdio::Close => StdioPlan::Close,
      Stdio::Redirect(_) => match stdio.raw_fd() {
        Some(fd) => StdioPlan::Dup(fd),
        None => StdioPlan::Inherit,
      },
    });

    // CPU rlimit is only a backstop behind the precise timers
    let cpu_backstop = limits
      .cpu_time_limit
      .or(limits.time_limit)
      .map(|limit| ceil_secs(limit) + 1);

    Ok(ChildImage {
      executable,
      argv,
      envp,
      working_directory,
      stdio,
      memory_limit: limits.memory_limit,
      cpu_backstop,
      max_output_size: limits.max_output_size,
    })
  }

  /// Set up the forked child and `execve`, reporting the first failure into `report`.
  ///
  /// `before_exec` runs last, right before `execve`.
  pub(crate) fn exec<F>(&self, report: SimBoxWritePipe, before_exec: F) -> !
  where
    F: FnOnce() -> Result<(), (&'static str, Errno)>,
  {
    if let Err((what, errno)) = self.prepare().and_then(|_| before_exec()) {
      report.report(what, errno);
    } else if let Err(errno) = execve(&self.executable, &self.argv, &self.envp) {
      report.report("execve", errno);
    }
    drop(report);
    unsafe { libc::_exit(1) }
  }

  fn prepare(&self) -> Result<(), (&'static str, Errno)> {
    // Ignored signals survive exec, and Rust hosts ignore SIGPIPE
    for sig in Signal::iterator() {
      if sig != Signal::SIGKILL && sig != Signal::SIGSTOP {
        unsafe { signal(sig, SigHandler::SigDfl) }.map_err(|e| ("signal()", e))?;
      }
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
      .map_err(|e| ("sigprocmask()", e))?;

    for (target, plan) in self.stdio.iter().enumerate() {
      let target = target as RawFd;
      match *plan {
        StdioPlan::Inherit => {}
        StdioPlan::Close => {
          let _ = close(target);
        }
        StdioPlan::Dup(fd) if fd == target => {
          fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(|e| ("fcntl()", e))?;
        }
        StdioPlan::Dup(fd) => {
          dup2(fd, target).map_err(|e| ("dup2()", e))?;
        }
      }
    }

    if let Some(dir) = &self.working_directory {
      chdir(dir.as_c_str()).map_err(|e| ("chdir()", e))?;
    }

    if let Some(memory) = self.memory_limit {
      setrlimit(Resource::RLIMIT_AS, memory, memory).map_err(|e| ("setrlimit(RLIMIT_AS)", e))?;
      setrlimit(Resource::RLIMIT_STACK, memory, memory)
        .map_err(|e| ("setrlimit(RLIMIT_STACK)", e))?;
    }
    if let Some(seconds) = self.cpu_backstop {
      setrlimit(Resource::RLIMIT_CPU, seconds, seconds)
        .map_err(|e| ("setrlimit(RLIMIT_CPU)", e))?;
    }
    let fsize = self.max_output_size.unwrap_or(RLIM_INFINITY);
    setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize).map_err(|e| ("setrlimit(RLIMIT_FSIZE)", e))?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(|e| ("setrlimit(RLIMIT_CORE)", e))?;
    Ok(())
  }
}

fn ceil_secs(limit: Duration) -> u64 {
  limit.as_secs() + u64::from(limit.subsec_nanos() > 0)
}

/// Kills and reaps a child on every path that did not reap it already
pub(crate) struct ChildGuard {
  pid: Pid,
  reaped: bool,
  kill_handle: Option<KillHandle>,
}

impl ChildGuard {
  pub(crate) fn new(pid: Pid, kill_handle: Option<KillHandle>) -> Self {
    if let Some(handle) = &kill_handle {
      handle.attach(pid);
    }
    ChildGuard {
      pid,
      reaped: false,
      kill_handle,
    }
  }

  pub(crate) fn set_reaped(&mut self) {
    self.reaped = true;
    if let Some(handle) = &self.kill_handle {
      handle.detach();
    }
  }
}

impl Drop for ChildGuard {
  fn drop(&mut self) {
    if let Some(handle) = &self.kill_handle {
      handle.detach();
    }
    if !self.reaped {
      debug!("Kill and reap child process {}", self.pid);
      let _ = kill(self.pid, Signal::SIGKILL);
      let _ = wait_child(self.pid, libc::__WALL);
    }
  }
}

/// Run one program with rlimits and timers, without any syscall policy.
///
/// `after_fork` runs in the parent right after `fork`, once the parent has dropped its copies
/// of the redirected descriptors.
pub fn spawn<F: FnOnce(Pid)>(
  executable: &Path,
  args: &[String],
  mut options: RunOptions,
  after_fork: F,
) -> Result<ExitReport, SimBoxError> {
  let image = ChildImage::new(executable, args, &options)?;
  let limits = options.get_limits().clone();
  let pipe = SimBoxPipe::new()?;

  info!("Spawn {}", executable.to_string_lossy());
  match unsafe { fork() } {
    Ok(ForkResult::Child) => image.exec(pipe.write(), || {
      // Parent arms the timers while we are stopped
      raise(Signal::SIGSTOP).map_err(|e| ("raise(SIGSTOP)", e))
    }),
    Ok(ForkResult::Parent { child }) => {
      let mut guard = ChildGuard::new(child, options.get_kill_handle().cloned());
      options.release_stdio();
      after_fork(child);
      let report_pipe = pipe.read()?;

      let (status, usage) = wait_child(child, WaitPidFlag::WUNTRACED.bits())?;
      let mut timers = None;
      let (status, usage) = match status {
        WaitStatus::Stopped(_, Signal::SIGSTOP) => {
          let mut wall = Timer::wall(child, limits.time_limit)?;
          let mut cpu = Timer::cpu(child, limits.cpu_time_limit)?;
          wall.arm()?;
          cpu.arm()?;
          timers = Some((wall, cpu));
          kill(child, Signal::SIGCONT)?;
          wait_for_exit(child)?
        }
        WaitStatus::Stopped(..) => {
          kill(child, Signal::SIGCONT)?;
          wait_for_exit(child)?
        }
        _ => (status, usage),
      };

      let runtime = match timers.as_mut() {
        Some((wall, cpu)) => {
          cpu.disarm();
          wall.deactivate_and_get_runtime()
        }
        None => Duration::ZERO,
      };
      guard.set_reaped();

      let termination = Termination::from_wait_status(&status).ok_or_else(|| {
        error!("Unexpected wait status {:?} of {}", status, child);
        SimBoxError::fork(format!("unexpected wait status {:?}", status))
      })?;
      let message = report_pipe.read()?;
      let report = ExitReport {
        runtime,
        cpu_runtime: usage.user + usage.system,
        user_time: usage.user,
        system_time: usage.system,
        termination,
        vm_peak: usage.max_rss,
        message: if message.is_empty() { None } else { Some(message) },
      };
      info!("Child {} {}", child, report.description());
      Ok(report)
    }
    Err(errno) => {
      error!("Fork failed: {}", errno);
      Err(SimBoxError::fork(errno.desc()))
    }
  }
}

fn wait_for_exit(child: Pid) -> Result<(WaitStatus, ChildUsage), SimBoxError> {
  loop {
    let (status, usage) = wait_child(child, 0)?;
    if Termination::from_wait_status(&status).is_some() {
      return Ok((status, usage));
    }
  }
}
