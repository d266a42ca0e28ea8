use std::env;
use std::ffi::CString;
use std::time::Duration;

use flexi_logger::DeferredNow;
use log::{error, info, Record};
use nix::errno::Errno;
use nix::libc::{self, c_int};
use nix::sys::wait::WaitStatus;
use nix::unistd::{sysconf, Pid, SysconfVar};

use crate::SimBoxError;

pub type MemoryLimitType = u64;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from conf.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> Result<CString, SimBoxError> {
  let string = string.as_ref();
  CString::new(string)
    .map_err(|_| SimBoxError::exec(format!("String {:?} contains a nul byte", string)))
}

pub fn parse_env(text: String) -> Result<(String, String), SimBoxError> {
  let arr = text.splitn(2, '=').collect::<Vec<&str>>();
  match arr.as_slice() {
    [key, value] if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    [key] if !key.is_empty() => {
      let value = env::var(key).unwrap_or_default();
      info!("Read environment variable {} = {}", key, value);
      Ok((key.to_string(), value))
    }
    _ => {
      error!("Wrong environment variable string ({}) format", &text);
      Err(SimBoxError::cli("Wrong environment variable string format"))
    }
  }
}

pub fn page_size() -> u64 {
  match sysconf(SysconfVar::PAGE_SIZE) {
    Ok(Some(size)) if size > 0 => size as u64,
    _ => 4096,
  }
}

pub(crate) fn timeval_duration(tv: &libc::timeval) -> Duration {
  Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// CPU time and peak resident memory charged to a reaped child
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChildUsage {
  pub user: Duration,
  pub system: Duration,
  /// Peak resident set size in bytes
  pub max_rss: u64,
}

/// `wait4` on one child, retrying on `EINTR`.
///
/// `nix` exposes no `wait4`, and `waitpid` drops the resource usage of the reaped child.
pub(crate) fn wait_child(pid: Pid, flags: c_int) -> Result<(WaitStatus, ChildUsage), SimBoxError> {
  let mut status: c_int = 0;
  // Safety: rusage is plain old data
  let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
  loop {
    let res = unsafe { libc::wait4(pid.as_raw(), &mut status, flags, &mut usage) };
    if res != -1 {
      break;
    }
    match Errno::last() {
      Errno::EINTR => continue,
      errno => return Err(errno.into()),
    }
  }
  let status = WaitStatus::from_raw(pid, status)?;
  let usage = ChildUsage {
    user: timeval_duration(&usage.ru_utime),
    system: timeval_duration(&usage.ru_stime),
    // Linux counts ru_maxrss in KiB
    max_rss: (usage.ru_maxrss.max(0) as u64) << 10,
  };
  Ok((status, usage))
}
