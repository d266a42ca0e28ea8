use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde_json::{json, Value};

/// How a child left the world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
  Exited(i32),
  Killed(i32),
  KilledAndDumped(i32),
}

/// Result of one run, produced once and then owned by whoever asked for it
#[derive(Debug, Clone, PartialEq)]
pub struct ExitReport {
  /// Wall clock time since the timers were armed
  pub runtime: Duration,
  /// User plus system time
  pub cpu_runtime: Duration,
  pub user_time: Duration,
  pub system_time: Duration,
  pub termination: Termination,
  /// Peak memory in bytes. Virtual memory sampled by the sandbox for traced runs, the kernel's
  /// peak resident set otherwise. The latter never drops below what the child shared with the
  /// host at `fork`.
  pub vm_peak: u64,
  /// Set when the sandbox intervened or the child failed before `exec`
  pub message: Option<String>,
}

impl Termination {
  pub(crate) fn from_wait_status(status: &WaitStatus) -> Option<Self> {
    match *status {
      WaitStatus::Exited(_, code) => Some(Termination::Exited(code)),
      WaitStatus::Signaled(_, signal, false) => Some(Termination::Killed(signal as i32)),
      WaitStatus::Signaled(_, signal, true) => Some(Termination::KilledAndDumped(signal as i32)),
      _ => None,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, Termination::Exited(0))
  }

  pub fn signal(&self) -> Option<i32> {
    match *self {
      Termination::Exited(_) => None,
      Termination::Killed(sig) | Termination::KilledAndDumped(sig) => Some(sig),
    }
  }

  pub fn was_killed(&self) -> bool {
    self.signal().is_some()
  }

  pub fn was_killed_by(&self, signal: Signal) -> bool {
    self.signal() == Some(signal as i32)
  }

  /// e.g. `exited with 1`, `killed by signal PIPE - Broken pipe`
  pub fn description(&self) -> String {
    match *self {
      Termination::Exited(code) => format!("exited with {}", code),
      Termination::Killed(sig) => format!("killed by signal {}", describe_signal(sig)),
      Termination::KilledAndDumped(sig) => {
        format!("killed and dumped by signal {}", describe_signal(sig))
      }
    }
  }
}

fn describe_signal(sig: i32) -> String {
  match Signal::try_from(sig) {
    Ok(signal) => {
      let name = signal.as_str();
      let abbrev = name.strip_prefix("SIG").unwrap_or(name);
      format!("{} - {}", abbrev, signal_text(signal))
    }
    Err(_) => format!("with number {}", sig),
  }
}

/// Same wording as glibc's `strsignal`
fn signal_text(signal: Signal) -> &'static str {
  match signal {
    Signal::SIGHUP => "Hangup",
    Signal::SIGINT => "Interrupt",
    Signal::SIGQUIT => "Quit",
    Signal::SIGILL => "Illegal instruction",
    Signal::SIGTRAP => "Trace/breakpoint trap",
    Signal::SIGABRT => "Aborted",
    Signal::SIGBUS => "Bus error",
    Signal::SIGFPE => "Floating point exception",
    Signal::SIGKILL => "Killed",
    Signal::SIGUSR1 => "User defined signal 1",
    Signal::SIGSEGV => "Segmentation fault",
    Signal::SIGUSR2 => "User defined signal 2",
    Signal::SIGPIPE => "Broken pipe",
    Signal::SIGALRM => "Alarm clock",
    Signal::SIGTERM => "Terminated",
    Signal::SIGSTKFLT => "Stack fault",
    Signal::SIGCHLD => "Child exited",
    Signal::SIGCONT => "Continued",
    Signal::SIGSTOP => "Stopped (signal)",
    Signal::SIGTSTP => "Stopped",
    Signal::SIGTTIN => "Stopped (tty input)",
    Signal::SIGTTOU => "Stopped (tty output)",
    Signal::SIGURG => "Urgent I/O condition",
    Signal::SIGXCPU => "CPU time limit exceeded",
    Signal::SIGXFSZ => "File size limit exceeded",
    Signal::SIGVTALRM => "Virtual timer expired",
    Signal::SIGPROF => "Profiling timer expired",
    Signal::SIGWINCH => "Window changed",
    Signal::SIGIO => "I/O possible",
    Signal::SIGPWR => "Power failure",
    Signal::SIGSYS => "Bad system call",
    #[allow(unreachable_patterns)]
    _ => "Unknown signal",
  }
}

impl ExitReport {
  /// The sandbox message when there is one, otherwise how the child ended
  pub fn description(&self) -> String {
    match &self.message {
      Some(message) if !message.is_empty() => message.clone(),
      _ => self.termination.description(),
    }
  }

  pub fn is_success(&self) -> bool {
    self.termination.is_success() && self.message.is_none()
  }

  pub fn report_human(&self) {
    let status = match self.termination {
      Termination::Exited(code) => {
        format!("\x1b[9{}m{}\x1b[39m", if code == 0 { 2 } else { 1 }, code)
      }
      _ => "\x1b[91m×\x1b[39m".to_string(),
    };
    let signal = match self.termination.signal() {
      Some(_) => format!("\x1b[91m{}\x1b[39m", self.termination.description()),
      None => "\x1b[92m✓\x1b[39m".to_string(),
    };

    println!();
    println!("\x1b[1mStatus\x1b[22m     {}", status);
    println!("\x1b[1mSignal\x1b[22m     {}", signal);
    println!("\x1b[1mTime\x1b[22m       {} ms", self.runtime.as_millis());
    println!("\x1b[1mCPU time\x1b[22m   {} ms", self.cpu_runtime.as_millis());
    println!("\x1b[1mTime user\x1b[22m  {} ms", self.user_time.as_millis());
    println!("\x1b[1mTime sys\x1b[22m   {} ms", self.system_time.as_millis());
    println!("\x1b[1mMemory\x1b[22m     {} KB", self.vm_peak / 1024);
    if let Some(message) = &self.message {
      println!("\x1b[1mMessage\x1b[22m    {}", message);
    }
    println!();
  }

  pub fn to_json(&self) -> Value {
    let (status, signal) = match self.termination {
      Termination::Exited(code) => (Some(code), None),
      _ => (None, self.termination.signal()),
    };
    json!({
      "ok": true,
      "status": status,
      "signal": signal,
      "description": self.description(),
      "time": self.runtime.as_millis() as u64,
      "cpu_time": self.cpu_runtime.as_millis() as u64,
      "time_user": self.user_time.as_millis() as u64,
      "time_sys": self.system_time.as_millis() as u64,
      "memory": self.vm_peak,
      "message": self.message,
    })
  }
}
