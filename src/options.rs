use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::utils::MemoryLimitType;

/// Limits applied to one run, fixed once the run starts
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
  /// Wall clock limit
  pub time_limit: Option<Duration>,
  /// CPU time limit (user + system)
  pub cpu_time_limit: Option<Duration>,
  /// Address space limit in bytes, also used as the stack limit
  pub memory_limit: Option<MemoryLimitType>,
  /// Largest file the child may write, in bytes
  pub max_output_size: Option<u64>,
  pub working_directory: PathBuf,
}

impl Default for ResourceLimits {
  fn default() -> Self {
    ResourceLimits {
      time_limit: None,
      cpu_time_limit: None,
      memory_limit: None,
      max_output_size: None,
      working_directory: PathBuf::from("."),
    }
  }
}

/// Where one standard stream of the child goes
#[derive(Debug)]
pub enum Stdio {
  Inherit,
  Close,
  Redirect(OwnedFd),
}

impl Stdio {
  pub fn file(file: File) -> Self {
    Stdio::Redirect(file.into())
  }

  pub fn is_closed(&self) -> bool {
    matches!(self, Stdio::Close)
  }

  pub(crate) fn raw_fd(&self) -> Option<RawFd> {
    match self {
      Stdio::Redirect(fd) => Some(fd.as_raw_fd()),
      _ => None,
    }
  }
}

/// Access mode a sandboxed `open` is allowed to request for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpenAccess {
  None,
  ReadOnly,
  WriteOnly,
  ReadWrite,
}

impl OpenAccess {
  /// Decode the `O_ACCMODE` bits of open flags
  pub fn from_flags(flags: i32) -> Self {
    match flags & OFlag::O_ACCMODE.bits() {
      f if f == OFlag::O_RDONLY.bits() => OpenAccess::ReadOnly,
      f if f == OFlag::O_WRONLY.bits() => OpenAccess::WriteOnly,
      f if f == OFlag::O_RDWR.bits() => OpenAccess::ReadWrite,
      _ => OpenAccess::None,
    }
  }
}

/// A path the sandboxed program may open, with the only mode it may open it in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedFile {
  path: PathBuf,
  access: OpenAccess,
}

impl AllowedFile {
  pub fn new<P: Into<PathBuf>>(path: P, access: OpenAccess) -> Self {
    AllowedFile {
      path: path.into(),
      access,
    }
  }

  pub fn read_only<P: Into<PathBuf>>(path: P) -> Self {
    Self::new(path, OpenAccess::ReadOnly)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn access(&self) -> OpenAccess {
    self.access
  }
}

#[derive(Debug, Default)]
struct KillState {
  pid: Option<Pid>,
  requested: bool,
}

/// Lets another thread SIGKILL a child while its run is still blocking.
///
/// A kill requested before the child exists is remembered and lands as soon as it is attached.
#[derive(Debug, Clone, Default)]
pub struct KillHandle(Arc<Mutex<KillState>>);

impl KillHandle {
  pub fn new() -> Self {
    KillHandle::default()
  }

  pub(crate) fn attach(&self, pid: Pid) {
    if let Ok(mut state) = self.0.lock() {
      state.pid = Some(pid);
      if state.requested {
        debug!("Kill child process {} on earlier request", pid);
        let _ = kill(pid, Signal::SIGKILL);
      }
    }
  }

  pub(crate) fn detach(&self) {
    if let Ok(mut state) = self.0.lock() {
      state.pid = None;
    }
  }

  /// Returns whether a live child was signalled
  pub fn kill(&self) -> bool {
    match self.0.lock() {
      Ok(mut state) => {
        state.requested = true;
        match state.pid {
          Some(pid) => {
            debug!("Kill child process {} on request", pid);
            kill(pid, Signal::SIGKILL).is_ok()
          }
          None => false,
        }
      }
      Err(_) => false,
    }
  }

  pub fn is_requested(&self) -> bool {
    self.0.lock().map(|state| state.requested).unwrap_or(false)
  }
}

/// Everything one run needs besides the executable and its arguments
#[derive(Debug, Default)]
pub struct RunOptions {
  limits: ResourceLimits,
  stdin: Stdio,
  stdout: Stdio,
  stderr: Stdio,
  env: Vec<(String, String)>,
  kill_handle: Option<KillHandle>,
}

impl Default for Stdio {
  fn default() -> Self {
    Stdio::Inherit
  }
}

impl RunOptions {
  pub fn new() -> Self {
    RunOptions::default()
  }

  /// Replace all the limits at once
  pub fn limits(mut self, limits: ResourceLimits) -> Self {
    self.limits = limits;
    self
  }

  /// Set wall time limit
  pub fn time_limit(mut self, value: Duration) -> Self {
    self.limits.time_limit = Some(value);
    self
  }

  /// Set CPU time limit
  pub fn cpu_time_limit(mut self, value: Duration) -> Self {
    self.limits.cpu_time_limit = Some(value);
    self
  }

  /// Set memory limit (unit: bytes)
  pub fn memory_limit(mut self, value: MemoryLimitType) -> Self {
    self.limits.memory_limit = Some(value);
    self
  }

  /// Set output size limit (unit: bytes)
  pub fn max_output_size(mut self, value: u64) -> Self {
    self.limits.max_output_size = Some(value);
    self
  }

  pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.limits.working_directory = path.into();
    self
  }

  pub fn stdin(mut self, stdio: Stdio) -> Self {
    self.stdin = stdio;
    self
  }

  pub fn stdout(mut self, stdio: Stdio) -> Self {
    self.stdout = stdio;
    self
  }

  pub fn stderr(mut self, stdio: Stdio) -> Self {
    self.stderr = stdio;
    self
  }

  /// Push an environment variable
  pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    self.env.push((key.into(), value.into()));
    self
  }

  pub fn envs(mut self, env: Vec<(String, String)>) -> Self {
    self.env.extend(env);
    self
  }

  pub fn kill_handle(mut self, handle: KillHandle) -> Self {
    self.kill_handle = Some(handle);
    self
  }

  pub fn get_limits(&self) -> &ResourceLimits {
    &self.limits
  }

  pub fn get_env(&self) -> &Vec<(String, String)> {
    &self.env
  }

  pub fn get_kill_handle(&self) -> Option<&KillHandle> {
    self.kill_handle.as_ref()
  }

  /// Standard streams in fd order, `[stdin, stdout, stderr]`
  pub fn stdio(&self) -> [&Stdio; 3] {
    [&self.stdin, &self.stdout, &self.stderr]
  }

  /// Drop the parent's copies of redirected descriptors
  pub(crate) fn release_stdio(&mut self) {
    self.stdin = Stdio::Inherit;
    self.stdout = Stdio::Inherit;
    self.stderr = Stdio::Inherit;
  }
}
