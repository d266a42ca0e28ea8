use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::prelude::RawFd;

use nix::{
  errno::Errno,
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::SimBoxError;

/// Longest error report the parent will pick up from a child
const REPORT_CAPACITY: usize = 4096;

/// Pipe used by a forked child to report why it could not reach `exec`
pub struct SimBoxPipe(RawFd, RawFd);

pub struct SimBoxReadPipe(RawFd);

pub struct SimBoxWritePipe(RawFd);

impl SimBoxPipe {
  pub fn new() -> Result<Self, SimBoxError> {
    let result = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok(SimBoxPipe(result.0, result.1))
  }

  pub fn read(self) -> Result<SimBoxReadPipe, SimBoxError> {
    close(self.1)?;
    Ok(SimBoxReadPipe(self.0))
  }

  /// Used in the child, so nothing here may allocate
  pub fn write(self) -> SimBoxWritePipe {
    let _ = close(self.0);
    SimBoxWritePipe(self.1)
  }
}

impl SimBoxReadPipe {
  /// Collect whatever the child managed to write before `exec` closed its end
  pub fn read(&self) -> Result<String, SimBoxError> {
    let mut buf = vec![0u8; REPORT_CAPACITY];
    let mut len = 0;
    while len < buf.len() {
      match unistd::read(self.0, &mut buf[len..]) {
        Ok(0) => break,
        Ok(n) => len += n,
        Err(Errno::EINTR) => continue,
        Err(Errno::EAGAIN) => break,
        Err(errno) => return Err(errno.into()),
      }
    }
    buf.truncate(len);
    Ok(String::from_utf8_lossy(&buf).into_owned())
  }
}

impl Drop for SimBoxReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl SimBoxWritePipe {
  /// Write `"<what>: <errno description>"`, best effort and allocation free
  pub fn report(&self, what: &str, errno: Errno) {
    for part in [what, ": ", errno.desc()] {
      let _ = unistd::write(self.0, part.as_bytes());
    }
  }
}

impl Drop for SimBoxWritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

/// Plain blocking pipe for wiring two children together, returns `(read, write)`
pub fn stream_pipe() -> Result<(OwnedFd, OwnedFd), SimBoxError> {
  let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
  // Safety: both descriptors were just created and are owned by nobody else
  let fds = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
  Ok(fds)
}
