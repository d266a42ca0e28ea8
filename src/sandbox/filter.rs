//! Seccomp BPF program covering both x86 syscall ABIs.
//!
//! ```text
//! [0]     load arch
//! [1-2]   x86_64 -> jump to the x86_64 section
//! [3-4]   i386   -> jump to the i386 section
//! [5]     RET TRACE(BadArch)
//! [6..]   native section, then the other one:
//!           load nr, (x86_64: x32 numbers -> forbidden),
//!           one JEQ + block per rule, RET TRACE(Forbidden)
//! ```

use nix::errno::Errno;
use nix::libc;

use crate::sandbox::syscall::{Arch, SyscallPolicy, SyscallRule, TrapReason};

const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

// seccomp_data offsets
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS: u32 = 16;

const X32_SYSCALL_BIT: u32 = 0x4000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
  pub code: u16,
  pub jt: u8,
  pub jf: u8,
  pub k: u32,
}

#[repr(C)]
struct SockFprog {
  len: u16,
  filter: *const SockFilter,
}

impl SockFilter {
  const fn stmt(code: u16, k: u32) -> Self {
    SockFilter {
      code,
      jt: 0,
      jf: 0,
      k,
    }
  }

  const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
    SockFilter { code, jt, jf, k }
  }

  const fn ret(k: u32) -> Self {
    Self::stmt(BPF_RET | BPF_K, k)
  }

  const fn load(offset: u32) -> Self {
    Self::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
  }
}

fn ret_trace(reason: TrapReason, arch: Arch) -> SockFilter {
  SockFilter::ret(SECCOMP_RET_TRACE | reason.data(arch) as u32)
}

fn ret_errno(errno: Errno) -> SockFilter {
  SockFilter::ret(SECCOMP_RET_ERRNO | (errno as u32 & 0xffff))
}

/// Instructions run once the syscall number matched
fn rule_block(rule: &SyscallRule, arch: Arch, closed_stdio: &[bool; 3]) -> Vec<SockFilter> {
  match rule {
    SyscallRule::Allow => vec![SockFilter::ret(SECCOMP_RET_ALLOW)],
    SyscallRule::Deny(errno) => vec![ret_errno(*errno)],
    SyscallRule::Trap(reason) => vec![ret_trace(*reason, arch)],
    SyscallRule::StdioGated(fd_args, errno) => {
      let mut block = vec![];
      for &arg in fd_args.iter() {
        let mut checks = vec![];
        for (fd, _) in closed_stdio.iter().enumerate().filter(|(_, closed)| **closed) {
          checks.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, fd as u32, 0, 1));
          checks.push(ret_errno(*errno));
        }
        if !checks.is_empty() {
          block.push(SockFilter::load(OFFSET_ARGS + 8 * arg as u32));
          block.extend(checks);
        }
      }
      block.push(SockFilter::ret(SECCOMP_RET_ALLOW));
      block
    }
  }
}

fn arch_section(policy: &SyscallPolicy, arch: Arch, closed_stdio: &[bool; 3]) -> Vec<SockFilter> {
  let mut section = vec![SockFilter::load(OFFSET_NR)];
  if arch == Arch::X86_64 {
    section.push(SockFilter::jump(
      BPF_JMP | BPF_JGE | BPF_K,
      X32_SYSCALL_BIT,
      0,
      1,
    ));
    section.push(ret_trace(TrapReason::Forbidden, arch));
  }
  for (nr, rule) in policy.rules(arch) {
    let block = rule_block(rule, arch, closed_stdio);
    section.push(SockFilter::jump(
      BPF_JMP | BPF_JEQ | BPF_K,
      nr,
      0,
      block.len() as u8,
    ));
    section.extend(block);
  }
  section.push(ret_trace(TrapReason::Forbidden, arch));
  section
}

/// Assemble the full program; `closed_stdio[fd]` is whether fd 0/1/2 was closed for the run
pub fn build(policy: &SyscallPolicy, closed_stdio: [bool; 3]) -> Vec<SockFilter> {
  let sections = Arch::filtered().map(|arch| (arch, arch_section(policy, arch, &closed_stdio)));
  let offset = |arch: Arch| -> u32 {
    // Sections start right after the 6 instruction header
    let mut start = 6;
    for (other, section) in sections.iter() {
      if *other == arch {
        break;
      }
      start += section.len() as u32;
    }
    start
  };

  let mut program = vec![SockFilter::load(OFFSET_ARCH)];
  for (index, arch) in [Arch::X86_64, Arch::X86].into_iter().enumerate() {
    let here = 2 * index as u32 + 1;
    program.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, arch.audit(), 0, 1));
    program.push(SockFilter::stmt(BPF_JMP | BPF_JA, offset(arch) - (here + 2)));
  }
  program.push(ret_trace(TrapReason::BadArch, Arch::native()));
  for (_, section) in sections {
    program.extend(section);
  }
  program
}

/// Install `program` on the calling process. Called in the child between fork and exec,
/// so it must not allocate.
pub fn install(program: &[SockFilter]) -> Result<(), Errno> {
  let prog = SockFprog {
    len: program.len() as u16,
    filter: program.as_ptr(),
  };
  unsafe {
    if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) == -1 {
      return Err(Errno::last());
    }
    if libc::syscall(
      libc::SYS_seccomp,
      SECCOMP_SET_MODE_FILTER,
      0 as libc::c_ulong,
      &prog as *const SockFprog,
    ) == -1
    {
      return Err(Errno::last());
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sandbox::syscall::number;

  const BPF_MAX_LEN: usize = 4096;

  /// Minimal interpreter for the instructions `build` emits
  fn run(program: &[SockFilter], arch: u32, nr: u32, args: [u32; 6]) -> u32 {
    let mut pc = 0;
    let mut acc = 0u32;
    loop {
      let ins = program[pc];
      pc += 1;
      match ins.code {
        c if c == BPF_LD | BPF_W | BPF_ABS => {
          acc = match ins.k {
            OFFSET_NR => nr,
            OFFSET_ARCH => arch,
            k => args[((k - OFFSET_ARGS) / 8) as usize],
          }
        }
        c if c == BPF_JMP | BPF_JA => pc += ins.k as usize,
        c if c == BPF_JMP | BPF_JEQ | BPF_K => {
          pc += (if acc == ins.k { ins.jt } else { ins.jf }) as usize
        }
        c if c == BPF_JMP | BPF_JGE | BPF_K => {
          pc += (if acc >= ins.k { ins.jt } else { ins.jf }) as usize
        }
        c if c == BPF_RET | BPF_K => return ins.k,
        c => panic!("unexpected opcode {:#x}", c),
      }
    }
  }

  fn trace(reason: TrapReason, arch: Arch) -> u32 {
    SECCOMP_RET_TRACE | reason.data(arch) as u32
  }

  fn nr(arch: Arch, name: &str) -> u32 {
    number(arch, name).unwrap()
  }

  #[test]
  fn program_fits_kernel_limit() {
    let program = build(&SyscallPolicy::default(), [true, true, true]);
    assert!(program.len() < BPF_MAX_LEN);
  }

  #[test]
  fn allow_and_trap_on_both_architectures() {
    let program = build(&SyscallPolicy::default(), [false, false, false]);
    for arch in [Arch::X86, Arch::X86_64] {
      let audit = arch.audit();
      assert_eq!(run(&program, audit, nr(arch, "futex"), [0; 6]), SECCOMP_RET_ALLOW);
      assert_eq!(run(&program, audit, nr(arch, "read"), [0; 6]), SECCOMP_RET_ALLOW);
      assert_eq!(
        run(&program, audit, nr(arch, "open"), [0; 6]),
        trace(TrapReason::Open, arch)
      );
      assert_eq!(
        run(&program, audit, nr(arch, "socket"), [0; 6]),
        trace(TrapReason::Forbidden, arch)
      );
      assert_eq!(
        run(&program, audit, nr(arch, "ioctl"), [1, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ERRNO | Errno::EPERM as u32
      );
    }
    assert_eq!(
      run(&program, Arch::X86.audit(), nr(Arch::X86, "mmap2"), [0; 6]),
      trace(TrapReason::VmChange, Arch::X86)
    );
  }

  #[test]
  fn unknown_architecture_and_x32() {
    let program = build(&SyscallPolicy::default(), [false, false, false]);
    assert_eq!(
      run(&program, 0xc000_00b7, 0, [0; 6]),
      trace(TrapReason::BadArch, Arch::native())
    );
    assert_eq!(
      run(&program, Arch::X86_64.audit(), X32_SYSCALL_BIT | 1, [0; 6]),
      trace(TrapReason::Forbidden, Arch::X86_64)
    );
  }

  #[test]
  fn closed_streams_are_gated() {
    let program = build(&SyscallPolicy::default(), [true, false, true]);
    for arch in [Arch::X86, Arch::X86_64] {
      let audit = arch.audit();
      let read = nr(arch, "read");
      assert_eq!(
        run(&program, audit, read, [0, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ERRNO | Errno::EBADF as u32
      );
      assert_eq!(run(&program, audit, read, [1, 0, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
      assert_eq!(run(&program, audit, read, [3, 0, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
      assert_eq!(
        run(&program, audit, nr(arch, "write"), [2, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ERRNO | Errno::EBADF as u32
      );
      assert_eq!(
        run(&program, audit, nr(arch, "lseek"), [0, 0, 0, 0, 0, 0]),
        SECCOMP_RET_ERRNO | Errno::ESPIPE as u32
      );
      // dup2(5, 2) targets a closed stream through its second argument
      assert_eq!(
        run(&program, audit, nr(arch, "dup2"), [5, 2, 0, 0, 0, 0]),
        SECCOMP_RET_ERRNO | Errno::EBADF as u32
      );
      assert_eq!(
        run(&program, audit, nr(arch, "dup2"), [5, 1, 0, 0, 0, 0]),
        SECCOMP_RET_ALLOW
      );
    }
  }
}
