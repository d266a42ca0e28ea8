use std::cmp::{max, min};
use std::fs::File;
use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

use crate::error::SimBoxError;
use crate::utils::page_size;

/// Consecutive memory syscalls without any change in VM size before the run counts as spinning
pub const VM_SPIN_LIMIT: u32 = 1024;

/// Longest path a tracee may pass to `open`, terminating nul included
pub const PATH_MAX: usize = 4096;

/// Per-run view of the traced child: memory sampling and reads from its address space
pub struct Tracee {
  pid: Pid,
  statm: File,
  page_size: u64,
  vm_peak: u64,
  last_vm: u64,
  unchanged_vm_samples: u32,
}

impl Tracee {
  pub fn open(pid: Pid) -> Result<Self, SimBoxError> {
    let statm = File::open(format!("/proc/{}/statm", pid))
      .map_err(|err| SimBoxError::fs(format!("open /proc/{}/statm: {}", pid, err)))?;
    Ok(Tracee {
      pid,
      statm,
      page_size: page_size(),
      vm_peak: 0,
      last_vm: 0,
      unchanged_vm_samples: 0,
    })
  }

  pub fn pid(&self) -> Pid {
    self.pid
  }

  pub fn vm_peak(&self) -> u64 {
    self.vm_peak
  }

  /// Current VM size in bytes; a zombie reports zero and leaves the peak alone
  pub fn sample_vm(&mut self) -> Result<u64, SimBoxError> {
    let mut buf = [0u8; 128];
    let len = self.statm.read_at(&mut buf, 0)?;
    let pages = std::str::from_utf8(&buf[..len])
      .ok()
      .and_then(|text| text.split_whitespace().next())
      .and_then(|field| field.parse::<u64>().ok())
      .ok_or_else(|| SimBoxError::fs(format!("malformed /proc/{}/statm", self.pid)))?;
    let current = pages * self.page_size;
    self.vm_peak = max(self.vm_peak, current);
    Ok(current)
  }

  /// Sample at a memory syscall; true once the tracee has spun `VM_SPIN_LIMIT` times
  /// without its VM size moving
  pub fn record_vm_syscall(&mut self) -> Result<bool, SimBoxError> {
    let current = self.sample_vm()?;
    if current == self.last_vm {
      self.unchanged_vm_samples += 1;
    } else {
      self.last_vm = current;
      self.unchanged_vm_samples = 0;
    }
    Ok(self.unchanged_vm_samples >= VM_SPIN_LIMIT)
  }

  /// Read a nul terminated string at `addr` in the tracee, at most `max_len` bytes including the nul.
  ///
  /// Reads page by page so a string ending just before an unmapped page is still readable.
  pub fn read_c_string(&self, addr: u64, max_len: usize) -> Result<Vec<u8>, Errno> {
    let page = self.page_size as usize;
    let mut addr = usize::try_from(addr).map_err(|_| Errno::EFAULT)?;
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; page];
    while bytes.len() < max_len {
      let want = min(page - addr % page, max_len - bytes.len());
      let read = process_vm_readv(
        self.pid,
        &mut [IoSliceMut::new(&mut chunk[..want])],
        &[RemoteIoVec {
          base: addr,
          len: want,
        }],
      )
      .map_err(|_| Errno::EFAULT)?;
      if read == 0 {
        return Err(Errno::EFAULT);
      }
      if let Some(end) = chunk[..read].iter().position(|&b| b == 0) {
        bytes.extend_from_slice(&chunk[..end]);
        return Ok(bytes);
      }
      bytes.extend_from_slice(&chunk[..read]);
      addr = addr.checked_add(read).ok_or(Errno::EFAULT)?;
    }
    Err(Errno::ENAMETOOLONG)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use nix::unistd::getpid;

  #[test]
  fn sample_own_memory() {
    let mut tracee = Tracee::open(getpid()).unwrap();
    let current = tracee.sample_vm().unwrap();
    assert!(current > 0);
    assert_eq!(tracee.vm_peak(), current);
  }

  #[test]
  fn spin_detection_needs_unchanged_samples() {
    let mut tracee = Tracee::open(getpid()).unwrap();
    tracee.last_vm = 1;
    assert!(!tracee.record_vm_syscall().unwrap());
    tracee.unchanged_vm_samples = VM_SPIN_LIMIT - 1;
    tracee.last_vm = tracee.sample_vm().unwrap();
    // Other test threads may map memory in between, so only check the counter moved
    let spinning = tracee.record_vm_syscall().unwrap();
    assert!(spinning || tracee.unchanged_vm_samples == 0);
  }

  #[test]
  fn read_strings_from_own_memory() {
    let tracee = Tracee::open(getpid()).unwrap();
    let text = b"/tmp/input.txt\0garbage";
    let bytes = tracee.read_c_string(text.as_ptr() as u64, PATH_MAX).unwrap();
    assert_eq!(bytes, b"/tmp/input.txt");

    let long = vec![b'a'; PATH_MAX + 10];
    assert_eq!(
      tracee.read_c_string(long.as_ptr() as u64, PATH_MAX),
      Err(Errno::ENAMETOOLONG)
    );
    assert_eq!(tracee.read_c_string(0, PATH_MAX), Err(Errno::EFAULT));
  }
}
