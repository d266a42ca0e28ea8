use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

/// Host side failures. Tracee misbehaviour is never reported through this type.
pub enum SimBoxError {
  Fork(String),
  Exec(String),
  Ptrace(String),
  Timer(String),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Compile(String),
  Logger(FlexiLoggerError),
}

pub enum SimBoxExit {
  Ok,
  Err(SimBoxError),
}

impl SimBoxError {
  pub fn fork<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Fork(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Exec(msg.into())
  }

  pub fn ptrace<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Ptrace(msg.into())
  }

  pub fn timer<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Timer(msg.into())
  }

  pub fn fs<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Fs(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Cli(msg.into())
  }

  pub fn compile<MS: Into<String>>(msg: MS) -> SimBoxError {
    SimBoxError::Compile(msg.into())
  }
}

impl Debug for SimBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for SimBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      SimBoxError::Fork(msg) => f.write_fmt(format_args!("SimBox Fork Error: {}", msg)),
      SimBoxError::Exec(msg) => f.write_fmt(format_args!("SimBox Exec Error: {}", msg)),
      SimBoxError::Ptrace(msg) => f.write_fmt(format_args!("SimBox Ptrace Error: {}", msg)),
      SimBoxError::Timer(msg) => f.write_fmt(format_args!("SimBox Timer Error: {}", msg)),
      SimBoxError::Nix(errno) => f.write_fmt(format_args!("SimBox Nix Error: {}", errno)),
      SimBoxError::Fs(msg) => f.write_fmt(format_args!("SimBox File System Error: {}", msg)),
      SimBoxError::Cli(msg) => f.write_fmt(format_args!("SimBox CLI Error: {}", msg)),
      SimBoxError::Compile(msg) => f.write_fmt(format_args!("SimBox Compile Error: {}", msg)),
      SimBoxError::Logger(err) => f.write_fmt(format_args!("SimBox Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for SimBoxError {
  fn from(errno: Errno) -> Self {
    SimBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for SimBoxError {
  fn from(err: std::io::Error) -> Self {
    SimBoxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for SimBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    SimBoxError::Logger(err)
  }
}

impl From<serde_json::Error> for SimBoxError {
  fn from(err: serde_json::Error) -> Self {
    SimBoxError::Cli(err.to_string())
  }
}

impl Error for SimBoxError {}

impl Termination for SimBoxExit {
  fn report(self) -> ExitCode {
    match self {
      SimBoxExit::Ok => ExitCode::SUCCESS.report(),
      SimBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              serde_json::json!({
                "ok": false,
                "type": prefix,
                "message": message,
              })
              .to_string()
            }
          }
          None => text,
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}
