//! ptrace + seccomp supervisor.
//!
//! The child installs the BPF program from [`filter`] right before `execve`. Calls the program
//! cannot settle by itself stop the child with `PTRACE_EVENT_SECCOMP`, and [`Sandbox`] decides
//! from the [`TrapReason`] carried in the event message.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc::{self, AT_EMPTY_PATH, AT_FDCWD};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::SimBoxError;
use crate::options::{AllowedFile, OpenAccess, RunOptions};
use crate::pipe::SimBoxPipe;
use crate::report::{ExitReport, Termination};
use crate::sandbox::regs::Registers;
use crate::sandbox::syscall::{display, name, Arch, SyscallPolicy, TrapReason};
use crate::sandbox::tracee::{Tracee, PATH_MAX};
use crate::spawner::{ChildGuard, ChildImage};
use crate::timer::Timer;
use crate::utils::{wait_child, ChildUsage};

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("the sandbox only supports x86 and x86_64 hosts");

pub mod filter;
pub mod regs;
pub mod syscall;
pub mod tracee;

pub const MEMORY_LIMIT_EXCEEDED: &str = "Memory limit exceeded";

/// `prlimit64` calls a tracee may make
const PRLIMIT_ALLOWANCE: u32 = 2;

/// What to do with the tracee after handling a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
  Continue,
  /// Continue, stopping again at the exit of the current syscall
  UntilSyscallExit,
  /// Already sent SIGKILL, just wait for it to land
  Killed,
}

#[derive(Debug, Clone, Copy)]
enum VmCall {
  Brk { requested: u64 },
  Map,
}

/// Memory syscall whose return value decides whether the limit was hit
#[derive(Debug, Clone, Copy)]
struct PendingVmCall {
  arch: Arch,
  call: VmCall,
}

/// Everything reset at the start of a run
#[derive(Debug, Default)]
struct RunState {
  allowed_files: Vec<AllowedFile>,
  closed_stdio: [bool; 3],
  memory_limit: Option<u64>,
  execve_count: u32,
  prlimit_count: u32,
  /// Set by the first `readlink`, after which startup only calls are forbidden
  startup_finished: bool,
  pending_vm: Option<PendingVmCall>,
  message: Option<String>,
}

/// Syscall filtering sandbox. Reusable for sequential runs, never shared between threads.
pub struct Sandbox {
  policy: SyscallPolicy,
  state: RunState,
}

impl Default for Sandbox {
  fn default() -> Self {
    Sandbox::new()
  }
}

impl Sandbox {
  pub fn new() -> Self {
    Sandbox {
      policy: SyscallPolicy::default(),
      state: RunState::default(),
    }
  }

  /// Run `executable` under the syscall policy, allowing `open` only on `allowed_files`
  pub fn run(
    &mut self,
    executable: &Path,
    args: &[String],
    options: RunOptions,
    allowed_files: &[AllowedFile],
  ) -> Result<ExitReport, SimBoxError> {
    self.run_with(executable, args, options, allowed_files, |_| {})
  }

  /// Same as `run`, calling `after_fork` with the tracee's pid the way `spawn` does
  pub fn run_with<F: FnOnce(Pid)>(
    &mut self,
    executable: &Path,
    args: &[String],
    mut options: RunOptions,
    allowed_files: &[AllowedFile],
    after_fork: F,
  ) -> Result<ExitReport, SimBoxError> {
    let closed_stdio = options.stdio().map(|stdio| stdio.is_closed());
    let limits = options.get_limits().clone();
    self.state = RunState {
      allowed_files: allowed_files.to_vec(),
      closed_stdio,
      memory_limit: limits.memory_limit,
      ..RunState::default()
    };

    let image = ChildImage::new(executable, args, &options)?;
    let program = filter::build(&self.policy, closed_stdio);
    let pipe = SimBoxPipe::new()?;

    info!("Run {} in sandbox", executable.to_string_lossy());
    match unsafe { fork() } {
      Ok(ForkResult::Child) => image.exec(pipe.write(), || {
        ptrace::traceme().map_err(|e| ("ptrace(PTRACE_TRACEME)", e))?;
        raise(Signal::SIGSTOP).map_err(|e| ("raise(SIGSTOP)", e))?;
        filter::install(&program).map_err(|e| ("seccomp()", e))
      }),
      Ok(ForkResult::Parent { child }) => {
        let mut guard = ChildGuard::new(child, options.get_kill_handle().cloned());
        options.release_stdio();
        after_fork(child);
        let report_pipe = pipe.read()?;

        let (status, usage) = wait_child(child, libc::__WALL)?;
        let (status, usage, runtime, vm_peak) = match status {
          WaitStatus::Stopped(_, Signal::SIGSTOP) => {
            ptrace::setoptions(
              child,
              Options::PTRACE_O_TRACESECCOMP
                | Options::PTRACE_O_TRACEEXEC
                | Options::PTRACE_O_TRACEEXIT
                | Options::PTRACE_O_TRACESYSGOOD
                | Options::PTRACE_O_EXITKILL,
            )
            .map_err(|e| SimBoxError::ptrace(format!("PTRACE_SETOPTIONS: {}", e)))?;
            let mut tracee = Tracee::open(child)?;
            let mut wall = Timer::wall(child, limits.time_limit)?;
            let mut cpu = Timer::cpu(child, limits.cpu_time_limit)?;
            resume(ptrace::cont(child, None))?;

            let (status, usage) = self.supervise(&mut tracee, &mut wall, &mut cpu)?;
            cpu.disarm();
            let runtime = wall.deactivate_and_get_runtime();
            (status, usage, runtime, tracee.vm_peak())
          }
          _ => (status, usage, Duration::ZERO, 0),
        };
        guard.set_reaped();

        let termination = Termination::from_wait_status(&status).ok_or_else(|| {
          error!("Unexpected wait status {:?} of {}", status, child);
          SimBoxError::ptrace(format!("unexpected wait status {:?}", status))
        })?;
        let child_message = report_pipe.read()?;
        let message = self
          .state
          .message
          .take()
          .or_else(|| Some(child_message).filter(|message| !message.is_empty()));
        let report = ExitReport {
          runtime,
          cpu_runtime: usage.user + usage.system,
          user_time: usage.user,
          system_time: usage.system,
          termination,
          vm_peak,
          message,
        };
        info!("Tracee {} {}", child, report.description());
        Ok(report)
      }
      Err(errno) => {
        error!("Fork failed: {}", errno);
        Err(SimBoxError::fork(errno.desc()))
      }
    }
  }

  /// Trace until the tracee is gone, returning its final status
  fn supervise(
    &mut self,
    tracee: &mut Tracee,
    wall: &mut Timer,
    cpu: &mut Timer,
  ) -> Result<(WaitStatus, ChildUsage), SimBoxError> {
    let pid = tracee.pid();
    loop {
      let (status, usage) = wait_child(pid, libc::__WALL)?;
      match status {
        WaitStatus::Exited(..) | WaitStatus::Signaled(..) => return Ok((status, usage)),
        WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_SECCOMP) => {
          let data = ptrace::getevent(pid)
            .map_err(|e| SimBoxError::ptrace(format!("PTRACE_GETEVENTMSG: {}", e)))?;
          match self.on_trap(tracee, data as u16)? {
            Resume::Continue => resume(ptrace::cont(pid, None))?,
            Resume::UntilSyscallExit => resume(ptrace::syscall(pid, None))?,
            Resume::Killed => {}
          }
        }
        WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => {
          if !wall.is_armed() {
            tracee.sample_vm()?;
            wall.arm()?;
            cpu.arm()?;
          }
          resume(ptrace::cont(pid, None))?;
        }
        WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXIT) => {
          tracee.sample_vm()?;
          resume(ptrace::cont(pid, None))?;
        }
        WaitStatus::PtraceEvent(..) => resume(ptrace::cont(pid, None))?,
        WaitStatus::PtraceSyscall(_) => {
          if self.on_syscall_exit(tracee)? != Resume::Killed {
            resume(ptrace::cont(pid, None))?;
          }
        }
        WaitStatus::Stopped(_, signal) => {
          let forward = match signal {
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => None,
            _ => Some(signal),
          };
          resume(ptrace::cont(pid, forward))?;
        }
        WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
      }
    }
  }

  fn on_trap(&mut self, tracee: &mut Tracee, data: u16) -> Result<Resume, SimBoxError> {
    let pid = tracee.pid();
    let (arch, reason) = TrapReason::from_data(data);
    let mut regs = Registers::fetch(pid)
      .map_err(|e| SimBoxError::ptrace(format!("PTRACE_GETREGSET: {}", e)))?;
    let nr = regs.syscall_number();

    match reason {
      TrapReason::Forbidden => self.forbid(tracee, arch, nr),
      TrapReason::BadArch => self.kill(
        tracee,
        format!("forbidden syscall: {} (unknown architecture)", nr),
      ),
      TrapReason::Execve => {
        self.state.execve_count += 1;
        if self.state.execve_count == 1 {
          Ok(Resume::Continue)
        } else {
          self.forbid(tracee, arch, nr)
        }
      }
      TrapReason::Open => self.check_open(tracee, &mut regs, arch, 0, 1),
      TrapReason::OpenAt => {
        if regs.arg_i32(arch, 0) != AT_FDCWD {
          debug!("Reject openat relative to fd {}", regs.arg_i32(arch, 0));
          return fail(pid, &mut regs, Errno::EPERM);
        }
        self.check_open(tracee, &mut regs, arch, 1, 2)
      }
      TrapReason::Readlink => {
        self.state.startup_finished = true;
        fail(pid, &mut regs, Errno::ENOENT)
      }
      TrapReason::StartupOnly => {
        if self.state.startup_finished {
          self.forbid(tracee, arch, nr)
        } else {
          Ok(Resume::Continue)
        }
      }
      TrapReason::VmChange => {
        if tracee.record_vm_syscall()? {
          return self.kill(tracee, MEMORY_LIMIT_EXCEEDED.to_string());
        }
        if self.state.memory_limit.is_none() {
          return Ok(Resume::Continue);
        }
        let call = match name(arch, nr as u32) {
          Some("brk") => VmCall::Brk {
            requested: regs.arg(arch, 0),
          },
          Some("munmap") => return Ok(Resume::Continue),
          _ => VmCall::Map,
        };
        self.state.pending_vm = Some(PendingVmCall { arch, call });
        Ok(Resume::UntilSyscallExit)
      }
      TrapReason::VmExit => {
        tracee.sample_vm()?;
        Ok(Resume::Continue)
      }
      TrapReason::Prlimit => {
        self.state.prlimit_count += 1;
        if self.state.prlimit_count <= PRLIMIT_ALLOWANCE {
          Ok(Resume::Continue)
        } else {
          self.forbid(tracee, arch, nr)
        }
      }
      TrapReason::Kill | TrapReason::Tkill => {
        if regs.arg_i32(arch, 0) == pid.as_raw() {
          Ok(Resume::Continue)
        } else {
          fail(pid, &mut regs, Errno::EPERM)
        }
      }
      TrapReason::Tgkill => {
        if regs.arg_i32(arch, 0) == pid.as_raw() && regs.arg_i32(arch, 1) == pid.as_raw() {
          Ok(Resume::Continue)
        } else {
          fail(pid, &mut regs, Errno::EPERM)
        }
      }
      TrapReason::PathQuery => self.check_path_query(tracee, &mut regs, arch, None, 0, None),
      TrapReason::StatAt => self.check_path_query(tracee, &mut regs, arch, Some(0), 1, Some(3)),
      TrapReason::Statx => self.check_path_query(tracee, &mut regs, arch, Some(0), 1, Some(2)),
    }
  }

  /// Only meaningful while a memory syscall is pending, see `TrapReason::VmChange`
  fn on_syscall_exit(&mut self, tracee: &mut Tracee) -> Result<Resume, SimBoxError> {
    let pending = match self.state.pending_vm.take() {
      Some(pending) => pending,
      None => return Ok(Resume::Continue),
    };
    let regs = Registers::fetch(tracee.pid())
      .map_err(|e| SimBoxError::ptrace(format!("PTRACE_GETREGSET: {}", e)))?;
    let result = regs.result(pending.arch);
    tracee.sample_vm()?;
    let failed = match pending.call {
      VmCall::Map => result == -(Errno::ENOMEM as i64),
      VmCall::Brk { requested } => {
        let current = match pending.arch {
          Arch::X86 => result as u32 as u64,
          Arch::X86_64 => result as u64,
        };
        requested != 0 && current < requested
      }
    };
    if failed {
      self.kill(tracee, MEMORY_LIMIT_EXCEEDED.to_string())
    } else {
      Ok(Resume::Continue)
    }
  }

  fn read_path(&self, tracee: &Tracee, regs: &Registers, arch: Arch, arg: usize) -> Result<Vec<u8>, Errno> {
    tracee.read_c_string(regs.arg(arch, arg), PATH_MAX)
  }

  fn check_open(
    &mut self,
    tracee: &mut Tracee,
    regs: &mut Registers,
    arch: Arch,
    path_arg: usize,
    flags_arg: usize,
  ) -> Result<Resume, SimBoxError> {
    let pid = tracee.pid();
    let path = match self.read_path(tracee, regs, arch, path_arg) {
      Ok(path) => path,
      Err(errno) => return fail(pid, regs, errno),
    };
    let path = Path::new(OsStr::from_bytes(&path));
    let access = OpenAccess::from_flags(regs.arg_i32(arch, flags_arg));
    let allowed = access != OpenAccess::None
      && self
        .state
        .allowed_files
        .iter()
        .any(|file| file.path() == path && file.access() == access);
    if allowed {
      debug!("Allow open {:?} ({:?})", path, access);
      Ok(Resume::Continue)
    } else {
      debug!("Deny open {:?} ({:?})", path, access);
      fail(pid, regs, Errno::EPERM)
    }
  }

  /// `access`/`stat` style calls: only listed paths exist, an `AT_EMPTY_PATH` call is an
  /// `fstat` on its fd argument
  fn check_path_query(
    &mut self,
    tracee: &mut Tracee,
    regs: &mut Registers,
    arch: Arch,
    dirfd_arg: Option<usize>,
    path_arg: usize,
    flags_arg: Option<usize>,
  ) -> Result<Resume, SimBoxError> {
    let pid = tracee.pid();
    let path = match self.read_path(tracee, regs, arch, path_arg) {
      Ok(path) => path,
      Err(errno) => return fail(pid, regs, errno),
    };
    let empty_path = flags_arg
      .map(|arg| regs.arg_i32(arch, arg) & AT_EMPTY_PATH != 0)
      .unwrap_or(false);

    if path.is_empty() && empty_path {
      let fd = dirfd_arg.map(|arg| regs.arg_i32(arch, arg)).unwrap_or(-1);
      let closed = usize::try_from(fd)
        .ok()
        .and_then(|fd| self.state.closed_stdio.get(fd).copied())
        .unwrap_or(false);
      return if closed {
        fail(pid, regs, Errno::EBADF)
      } else {
        Ok(Resume::Continue)
      };
    }

    let relative = dirfd_arg
      .map(|arg| regs.arg_i32(arch, arg) != AT_FDCWD)
      .unwrap_or(false);
    let path = Path::new(OsStr::from_bytes(&path));
    let listed = self
      .state
      .allowed_files
      .iter()
      .any(|file| file.path() == path && file.access() != OpenAccess::None);
    if listed && !relative {
      Ok(Resume::Continue)
    } else {
      debug!("Hide {:?} from path query", path);
      fail(pid, regs, Errno::ENOENT)
    }
  }

  fn forbid(&mut self, tracee: &mut Tracee, arch: Arch, nr: u64) -> Result<Resume, SimBoxError> {
    self.kill(tracee, format!("forbidden syscall: {}", display(arch, nr)))
  }

  /// Record why and SIGKILL the tracee; the terminal wait happens in `supervise`
  fn kill(&mut self, tracee: &mut Tracee, message: String) -> Result<Resume, SimBoxError> {
    warn!("Kill tracee {}: {}", tracee.pid(), message);
    tracee.sample_vm()?;
    if self.state.message.is_none() {
      self.state.message = Some(message);
    }
    match kill(tracee.pid(), Signal::SIGKILL) {
      Ok(()) | Err(Errno::ESRCH) => Ok(Resume::Killed),
      Err(errno) => Err(errno.into()),
    }
  }
}

/// Skip the pending syscall, making it return `-errno`
fn fail(pid: Pid, regs: &mut Registers, errno: Errno) -> Result<Resume, SimBoxError> {
  regs.skip_with_error(errno);
  regs
    .store(pid)
    .map_err(|e| SimBoxError::ptrace(format!("PTRACE_SETREGSET: {}", e)))?;
  Ok(Resume::Continue)
}

/// A tracee that vanished between its stop and our request is reported by the next wait
fn resume(result: nix::Result<()>) -> Result<(), SimBoxError> {
  match result {
    Ok(()) | Err(Errno::ESRCH) => Ok(()),
    Err(errno) => Err(SimBoxError::ptrace(format!("resume tracee: {}", errno))),
  }
}
