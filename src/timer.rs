use std::ptr;
use std::sync::Once;
use std::time::{Duration, Instant};

use log::debug;
use nix::errno::Errno;
use nix::libc::{self, c_int, c_void};
use nix::unistd::Pid;

use crate::error::SimBoxError;

static INSTALL_HANDLER: Once = Once::new();

/// Runs on whichever thread takes the signal; the pid to kill travels in `si_value`
extern "C" fn on_expire(_sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
  if info.is_null() {
    return;
  }
  let pid = unsafe { (*info).si_value().sival_ptr } as libc::pid_t;
  if pid > 0 {
    unsafe {
      libc::kill(pid, libc::SIGKILL);
    }
  }
}

fn install_handler() -> Result<(), SimBoxError> {
  let mut result = Ok(());
  INSTALL_HANDLER.call_once(|| unsafe {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = on_expire as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    if libc::sigaction(libc::SIGRTMIN(), &action, ptr::null_mut()) == -1 {
      result = Err(SimBoxError::timer(format!(
        "sigaction failed: {}",
        Errno::last()
      )));
    }
  });
  result
}

/// One-shot POSIX timer that SIGKILLs the watched pid when it fires.
///
/// A timer without a limit never fires but still measures the runtime since `arm`.
/// The kernel timer is deleted on `disarm`, `deactivate_and_get_runtime` or drop.
///
/// The first timer with a limit installs a process wide `SIGRTMIN` handler and it is never
/// restored. Hosts must not use `SIGRTMIN` for anything else.
pub struct Timer {
  id: Option<libc::timer_t>,
  limit: Option<Duration>,
  armed_at: Option<Instant>,
}

impl Timer {
  /// Wall clock timer
  pub fn wall(pid: Pid, limit: Option<Duration>) -> Result<Self, SimBoxError> {
    Self::new(pid, libc::CLOCK_MONOTONIC, limit)
  }

  /// Timer on the CPU clock of `pid`
  pub fn cpu(pid: Pid, limit: Option<Duration>) -> Result<Self, SimBoxError> {
    if limit.is_none() {
      return Self::new(pid, libc::CLOCK_MONOTONIC, None);
    }
    let mut clock: libc::clockid_t = 0;
    let res = unsafe { libc::clock_getcpuclockid(pid.as_raw(), &mut clock) };
    if res != 0 {
      return Err(SimBoxError::timer(format!(
        "clock_getcpuclockid({}) failed: {}",
        pid,
        Errno::from_i32(res)
      )));
    }
    Self::new(pid, clock, limit)
  }

  fn new(pid: Pid, clock: libc::clockid_t, limit: Option<Duration>) -> Result<Self, SimBoxError> {
    let mut timer = Timer {
      id: None,
      limit,
      armed_at: None,
    };
    if limit.is_none() {
      return Ok(timer);
    }
    install_handler()?;

    let mut id: libc::timer_t = ptr::null_mut();
    unsafe {
      let mut event: libc::sigevent = std::mem::zeroed();
      event.sigev_notify = libc::SIGEV_SIGNAL;
      event.sigev_signo = libc::SIGRTMIN();
      event.sigev_value = libc::sigval {
        sival_ptr: pid.as_raw() as usize as *mut c_void,
      };
      if libc::timer_create(clock, &mut event, &mut id) == -1 {
        return Err(SimBoxError::timer(format!(
          "timer_create failed: {}",
          Errno::last()
        )));
      }
    }
    timer.id = Some(id);
    Ok(timer)
  }

  /// Start counting; the kill fires once the limit elapses on the timer's clock
  pub fn arm(&mut self) -> Result<(), SimBoxError> {
    self.armed_at = Some(Instant::now());
    let (id, limit) = match (self.id, self.limit) {
      (Some(id), Some(limit)) => (id, limit),
      _ => return Ok(()),
    };
    // A zero it_value would disarm the timer instead of firing it
    let limit = limit.max(Duration::from_nanos(1));
    let spec = libc::itimerspec {
      it_interval: libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
      },
      it_value: libc::timespec {
        tv_sec: limit.as_secs() as libc::time_t,
        tv_nsec: limit.subsec_nanos() as libc::c_long,
      },
    };
    if unsafe { libc::timer_settime(id, 0, &spec, ptr::null_mut()) } == -1 {
      return Err(SimBoxError::timer(format!(
        "timer_settime failed: {}",
        Errno::last()
      )));
    }
    debug!("Arm timer with limit {:?}", limit);
    Ok(())
  }

  pub fn is_armed(&self) -> bool {
    self.armed_at.is_some()
  }

  pub fn disarm(&mut self) {
    if let Some(id) = self.id.take() {
      unsafe {
        libc::timer_delete(id);
      }
    }
  }

  /// Wall time since `arm`, zero if it was never armed
  pub fn deactivate_and_get_runtime(&mut self) -> Duration {
    self.disarm();
    self
      .armed_at
      .map(|armed_at| armed_at.elapsed())
      .unwrap_or(Duration::ZERO)
  }
}

impl Drop for Timer {
  fn drop(&mut self) {
    self.disarm();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn limited_timer_owns_sigrtmin() {
    let timer = Timer::wall(Pid::from_raw(i32::MAX), Some(Duration::from_secs(60))).unwrap();
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::sigaction(libc::SIGRTMIN(), ptr::null(), &mut current) };
    assert_eq!(res, 0);
    assert_eq!(current.sa_sigaction, on_expire as usize);
    drop(timer);

    // 计时器删除后处理函数仍然保留
    let res = unsafe { libc::sigaction(libc::SIGRTMIN(), ptr::null(), &mut current) };
    assert_eq!(res, 0);
    assert_eq!(current.sa_sigaction, on_expire as usize);
  }
}
