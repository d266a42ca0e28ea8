use std::mem::size_of;
use std::ptr;

use nix::errno::Errno;
use nix::libc::{self, c_void};
use nix::unistd::Pid;

use crate::sandbox::syscall::Arch;

const NT_PRSTATUS: libc::c_ulong = 1;

/// `user_regs_struct` of an i386 tracee
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86Regs {
  pub ebx: u32,
  pub ecx: u32,
  pub edx: u32,
  pub esi: u32,
  pub edi: u32,
  pub ebp: u32,
  pub eax: u32,
  pub xds: u32,
  pub xes: u32,
  pub xfs: u32,
  pub xgs: u32,
  pub orig_eax: u32,
  pub eip: u32,
  pub xcs: u32,
  pub eflags: u32,
  pub esp: u32,
  pub xss: u32,
}

/// `user_regs_struct` of an x86_64 tracee
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Regs {
  pub r15: u64,
  pub r14: u64,
  pub r13: u64,
  pub r12: u64,
  pub rbp: u64,
  pub rbx: u64,
  pub r11: u64,
  pub r10: u64,
  pub r9: u64,
  pub r8: u64,
  pub rax: u64,
  pub rcx: u64,
  pub rdx: u64,
  pub rsi: u64,
  pub rdi: u64,
  pub orig_rax: u64,
  pub rip: u64,
  pub cs: u64,
  pub eflags: u64,
  pub rsp: u64,
  pub ss: u64,
  pub fs_base: u64,
  pub gs_base: u64,
  pub ds: u64,
  pub es: u64,
  pub fs: u64,
  pub gs: u64,
}

/// General purpose registers in the layout of the tracee's own ABI.
///
/// The layout follows the tracee process, while the syscall ABI may differ: a 64-bit process
/// can still enter through `int 0x80`. Argument accessors therefore take the syscall's `Arch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registers {
  X86(X86Regs),
  X86_64(X86_64Regs),
}

impl Registers {
  /// `PTRACE_GETREGSET`; the returned size tells the layout apart
  pub fn fetch(pid: Pid) -> Result<Self, Errno> {
    let mut regs = X86_64Regs::default();
    let mut iov = libc::iovec {
      iov_base: &mut regs as *mut X86_64Regs as *mut c_void,
      iov_len: size_of::<X86_64Regs>(),
    };
    let res = unsafe {
      libc::ptrace(
        libc::PTRACE_GETREGSET,
        pid.as_raw(),
        NT_PRSTATUS,
        &mut iov as *mut libc::iovec,
      )
    };
    if res == -1 {
      return Err(Errno::last());
    }
    match iov.iov_len {
      len if len == size_of::<X86_64Regs>() => Ok(Registers::X86_64(regs)),
      len if len == size_of::<X86Regs>() => {
        // Safety: the kernel filled the head of the buffer with the i386 layout
        let regs = unsafe { ptr::read(&regs as *const X86_64Regs as *const X86Regs) };
        Ok(Registers::X86(regs))
      }
      _ => Err(Errno::EINVAL),
    }
  }

  /// `PTRACE_SETREGSET` with the same layout that was fetched
  pub fn store(&self, pid: Pid) -> Result<(), Errno> {
    let mut copy = *self;
    let (base, len) = match &mut copy {
      Registers::X86(regs) => (regs as *mut X86Regs as *mut c_void, size_of::<X86Regs>()),
      Registers::X86_64(regs) => (regs as *mut X86_64Regs as *mut c_void, size_of::<X86_64Regs>()),
    };
    let mut iov = libc::iovec {
      iov_base: base,
      iov_len: len,
    };
    let res = unsafe {
      libc::ptrace(
        libc::PTRACE_SETREGSET,
        pid.as_raw(),
        NT_PRSTATUS,
        &mut iov as *mut libc::iovec,
      )
    };
    if res == -1 {
      Err(Errno::last())
    } else {
      Ok(())
    }
  }

  pub fn syscall_number(&self) -> u64 {
    match self {
      Registers::X86(regs) => regs.orig_eax as u64,
      Registers::X86_64(regs) => regs.orig_rax & 0xffff_ffff,
    }
  }

  /// Syscall argument `index` (0 to 5). 32-bit ABI arguments are zero extended.
  pub fn arg(&self, arch: Arch, index: usize) -> u64 {
    match (self, arch) {
      (Registers::X86_64(regs), Arch::X86_64) => {
        [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9][index]
      }
      (Registers::X86_64(regs), Arch::X86) => {
        [regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rbp][index] & 0xffff_ffff
      }
      (Registers::X86(regs), _) => {
        [regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi, regs.ebp][index] as u64
      }
    }
  }

  /// Signed 32-bit view of an argument, for fds and `AT_FDCWD`
  pub fn arg_i32(&self, arch: Arch, index: usize) -> i32 {
    self.arg(arch, index) as u32 as i32
  }

  /// Syscall return value, only meaningful at syscall exit
  pub fn result(&self, arch: Arch) -> i64 {
    match (self, arch) {
      (Registers::X86_64(regs), Arch::X86_64) => regs.rax as i64,
      (Registers::X86_64(regs), Arch::X86) => regs.rax as u32 as i32 as i64,
      (Registers::X86(regs), _) => regs.eax as i32 as i64,
    }
  }

  pub fn set_syscall_number(&mut self, nr: i64) {
    match self {
      Registers::X86(regs) => regs.orig_eax = nr as u32,
      Registers::X86_64(regs) => regs.orig_rax = nr as u64,
    }
  }

  pub fn set_result(&mut self, value: i64) {
    match self {
      Registers::X86(regs) => regs.eax = value as u32,
      Registers::X86_64(regs) => regs.rax = value as u64,
    }
  }

  /// Make the pending syscall a no-op that returns `-errno`
  pub fn skip_with_error(&mut self, errno: Errno) {
    self.set_syscall_number(-1);
    self.set_result(-(errno as i64));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layouts_match_kernel_sizes() {
    assert_eq!(size_of::<X86Regs>(), 68);
    assert_eq!(size_of::<X86_64Regs>(), 216);
  }

  #[test]
  fn arguments_follow_syscall_abi() {
    let regs = Registers::X86_64(X86_64Regs {
      rdi: 1,
      rsi: 2,
      rdx: 3,
      r10: 4,
      r8: 5,
      r9: 6,
      rbx: 0x1_0000_0011,
      rcx: 12,
      rbp: 16,
      orig_rax: 257,
      ..Default::default()
    });
    assert_eq!(regs.syscall_number(), 257);
    assert_eq!(
      (0..6).map(|i| regs.arg(Arch::X86_64, i)).collect::<Vec<_>>(),
      vec![1, 2, 3, 4, 5, 6]
    );
    assert_eq!(regs.arg(Arch::X86, 0), 0x11);
    assert_eq!(regs.arg(Arch::X86, 1), 12);
    assert_eq!(regs.arg(Arch::X86, 3), 2);
    assert_eq!(regs.arg(Arch::X86, 5), 16);

    let regs = Registers::X86(X86Regs {
      ebx: (-100i32) as u32,
      ecx: 7,
      orig_eax: 295,
      ..Default::default()
    });
    assert_eq!(regs.syscall_number(), 295);
    assert_eq!(regs.arg_i32(Arch::X86, 0), -100);
    assert_eq!(regs.arg(Arch::X86, 1), 7);
  }

  #[test]
  fn skip_rewrites_number_and_result() {
    for mut regs in [
      Registers::X86(X86Regs::default()),
      Registers::X86_64(X86_64Regs::default()),
    ] {
      regs.skip_with_error(Errno::EPERM);
      assert_eq!(regs.result(Arch::X86), -(Errno::EPERM as i64));
      match regs {
        Registers::X86(regs) => assert_eq!(regs.orig_eax, u32::MAX),
        Registers::X86_64(regs) => assert_eq!(regs.orig_rax, u64::MAX),
      }
    }
  }
}
