use std::collections::HashMap;

use lazy_static::lazy_static;
use nix::errno::Errno;

/// Syscall ABI of one intercepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  X86,
  X86_64,
}

impl Arch {
  pub const AUDIT_X86: u32 = 0x4000_0003;
  pub const AUDIT_X86_64: u32 = 0xc000_003e;

  pub fn audit(self) -> u32 {
    match self {
      Arch::X86 => Self::AUDIT_X86,
      Arch::X86_64 => Self::AUDIT_X86_64,
    }
  }

  #[cfg(target_arch = "x86_64")]
  pub fn native() -> Arch {
    Arch::X86_64
  }

  #[cfg(target_arch = "x86")]
  pub fn native() -> Arch {
    Arch::X86
  }

  /// Native first, so a 64-bit host still filters 32-bit syscalls
  pub fn filtered() -> [Arch; 2] {
    match Self::native() {
      Arch::X86_64 => [Arch::X86_64, Arch::X86],
      Arch::X86 => [Arch::X86, Arch::X86_64],
    }
  }
}

/// Why the filter stopped the tracee, carried in the `SECCOMP_RET_TRACE` data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrapReason {
  Forbidden = 0,
  BadArch = 1,
  Execve = 2,
  Open = 3,
  OpenAt = 4,
  Readlink = 5,
  StartupOnly = 6,
  VmChange = 7,
  VmExit = 8,
  Prlimit = 9,
  Kill = 10,
  Tgkill = 11,
  Tkill = 12,
  PathQuery = 13,
  StatAt = 14,
  Statx = 15,
}

const X86_DATA_BIT: u16 = 0x100;

impl TrapReason {
  const ALL: [TrapReason; 16] = [
    TrapReason::Forbidden,
    TrapReason::BadArch,
    TrapReason::Execve,
    TrapReason::Open,
    TrapReason::OpenAt,
    TrapReason::Readlink,
    TrapReason::StartupOnly,
    TrapReason::VmChange,
    TrapReason::VmExit,
    TrapReason::Prlimit,
    TrapReason::Kill,
    TrapReason::Tgkill,
    TrapReason::Tkill,
    TrapReason::PathQuery,
    TrapReason::StatAt,
    TrapReason::Statx,
  ];

  pub fn data(self, arch: Arch) -> u16 {
    let arch_bit = if arch == Arch::X86 { X86_DATA_BIT } else { 0 };
    self as u16 | arch_bit
  }

  /// Inverse of `data`; unknown data decodes as `Forbidden`
  pub fn from_data(data: u16) -> (Arch, TrapReason) {
    let arch = if data & X86_DATA_BIT != 0 {
      Arch::X86
    } else {
      Arch::X86_64
    };
    let reason = Self::ALL
      .get((data & 0xff) as usize)
      .copied()
      .unwrap_or(TrapReason::Forbidden);
    (arch, reason)
  }
}

/// What the BPF program does with a syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallRule {
  Allow,
  /// Fail with errno without entering the kernel
  Deny(Errno),
  /// Fail with errno when any of the listed fd arguments is a closed standard stream
  StdioGated(&'static [usize], Errno),
  Trap(TrapReason),
}

/// Ordered syscall rules; anything not listed traps as forbidden
#[derive(Debug, Clone)]
pub struct SyscallPolicy {
  rules: Vec<(&'static str, SyscallRule)>,
}

impl Default for SyscallPolicy {
  fn default() -> Self {
    let mut policy = SyscallPolicy { rules: vec![] };
    // 信号、时间与线程本地存储
    for name in [
      "rt_sigaction",
      "rt_sigprocmask",
      "rt_sigreturn",
      "sigreturn",
      "sigaltstack",
      "restart_syscall",
      "clock_gettime",
      "clock_gettime64",
      "clock_getres",
      "clock_getres_time64",
      "clock_nanosleep",
      "clock_nanosleep_time64",
      "nanosleep",
      "gettimeofday",
      "time",
      "times",
      "futex",
      "futex_time64",
      "set_tid_address",
      "set_robust_list",
      "rseq",
      "sched_yield",
      "mprotect",
      "madvise",
      "getpid",
      "gettid",
      "getppid",
      "getuid",
      "getgid",
      "geteuid",
      "getegid",
      "getuid32",
      "getgid32",
      "geteuid32",
      "getegid32",
      "getrlimit",
      "ugetrlimit",
      "getrusage",
      "getrandom",
      "close",
    ] {
      policy.allow(name);
    }
    // 标准输入输出
    for name in ["read", "write", "readv", "writev", "pread64", "pwrite64", "fstat", "fstat64"] {
      policy.gated(name, &[0], Errno::EBADF);
    }
    policy
      .gated("lseek", &[0], Errno::ESPIPE)
      .gated("_llseek", &[0], Errno::ESPIPE)
      .gated("fcntl", &[0], Errno::EBADF)
      .gated("fcntl64", &[0], Errno::EBADF)
      .gated("dup", &[0], Errno::EBADF)
      .gated("dup2", &[0, 1], Errno::EBADF)
      .gated("dup3", &[0, 1], Errno::EBADF);
    // 禁用进程与系统信息
    policy
      .deny("ioctl", Errno::EPERM)
      .deny("clone", Errno::EPERM)
      .deny("sysinfo", Errno::EPERM);
    policy
      .trap("execve", TrapReason::Execve)
      .trap("open", TrapReason::Open)
      .trap("openat", TrapReason::OpenAt)
      .trap("readlink", TrapReason::Readlink)
      .trap("readlinkat", TrapReason::Readlink)
      .trap("uname", TrapReason::StartupOnly)
      .trap("set_thread_area", TrapReason::StartupOnly)
      .trap("arch_prctl", TrapReason::StartupOnly)
      .trap("prlimit64", TrapReason::Prlimit)
      .trap("kill", TrapReason::Kill)
      .trap("tgkill", TrapReason::Tgkill)
      .trap("tkill", TrapReason::Tkill)
      .trap("exit", TrapReason::VmExit)
      .trap("exit_group", TrapReason::VmExit)
      .trap("access", TrapReason::PathQuery)
      .trap("stat", TrapReason::PathQuery)
      .trap("lstat", TrapReason::PathQuery)
      .trap("stat64", TrapReason::PathQuery)
      .trap("lstat64", TrapReason::PathQuery)
      .trap("newfstatat", TrapReason::StatAt)
      .trap("fstatat64", TrapReason::StatAt)
      .trap("statx", TrapReason::Statx);
    for name in ["brk", "mmap", "mmap2", "mremap", "munmap"] {
      policy.trap(name, TrapReason::VmChange);
    }
    policy
  }
}

impl SyscallPolicy {
  pub fn allow(&mut self, name: &'static str) -> &mut Self {
    self.rules.push((name, SyscallRule::Allow));
    self
  }

  pub fn deny(&mut self, name: &'static str, errno: Errno) -> &mut Self {
    self.rules.push((name, SyscallRule::Deny(errno)));
    self
  }

  pub fn gated(&mut self, name: &'static str, fd_args: &'static [usize], errno: Errno) -> &mut Self {
    self.rules.push((name, SyscallRule::StdioGated(fd_args, errno)));
    self
  }

  pub fn trap(&mut self, name: &'static str, reason: TrapReason) -> &mut Self {
    self.rules.push((name, SyscallRule::Trap(reason)));
    self
  }

  /// Rules with their number on `arch`, skipping calls the architecture lacks
  pub fn rules(&self, arch: Arch) -> Vec<(u32, &SyscallRule)> {
    self
      .rules
      .iter()
      .filter_map(|(name, rule)| number(arch, name).map(|nr| (nr, rule)))
      .collect()
  }
}

/// `(name, i386, x86_64)`
const SYSCALL_TABLE: &[(&str, Option<u32>, Option<u32>)] = &[
  ("restart_syscall", Some(0), Some(219)),
  ("exit", Some(1), Some(60)),
  ("fork", Some(2), Some(57)),
  ("read", Some(3), Some(0)),
  ("write", Some(4), Some(1)),
  ("open", Some(5), Some(2)),
  ("close", Some(6), Some(3)),
  ("waitpid", Some(7), None),
  ("unlink", Some(10), Some(87)),
  ("execve", Some(11), Some(59)),
  ("chdir", Some(12), Some(80)),
  ("time", Some(13), Some(201)),
  ("lseek", Some(19), Some(8)),
  ("getpid", Some(20), Some(39)),
  ("setuid", Some(23), Some(105)),
  ("getuid", Some(24), Some(102)),
  ("ptrace", Some(26), Some(101)),
  ("access", Some(33), Some(21)),
  ("kill", Some(37), Some(62)),
  ("rename", Some(38), Some(82)),
  ("mkdir", Some(39), Some(83)),
  ("dup", Some(41), Some(32)),
  ("pipe", Some(42), Some(22)),
  ("times", Some(43), Some(100)),
  ("brk", Some(45), Some(12)),
  ("getgid", Some(47), Some(104)),
  ("geteuid", Some(49), Some(107)),
  ("getegid", Some(50), Some(108)),
  ("ioctl", Some(54), Some(16)),
  ("fcntl", Some(55), Some(72)),
  ("dup2", Some(63), Some(33)),
  ("getppid", Some(64), Some(110)),
  ("getrlimit", Some(76), Some(97)),
  ("getrusage", Some(77), Some(98)),
  ("gettimeofday", Some(78), Some(96)),
  ("readlink", Some(85), Some(89)),
  ("mmap", Some(90), Some(9)),
  ("munmap", Some(91), Some(11)),
  ("socketcall", Some(102), None),
  ("stat", Some(106), Some(4)),
  ("lstat", Some(107), Some(6)),
  ("fstat", Some(108), Some(5)),
  ("sysinfo", Some(116), Some(99)),
  ("sigreturn", Some(119), None),
  ("clone", Some(120), Some(56)),
  ("uname", Some(122), Some(63)),
  ("mprotect", Some(125), Some(10)),
  ("_llseek", Some(140), None),
  ("readv", Some(145), Some(19)),
  ("writev", Some(146), Some(20)),
  ("sched_yield", Some(158), Some(24)),
  ("nanosleep", Some(162), Some(35)),
  ("mremap", Some(163), Some(25)),
  ("poll", Some(168), Some(7)),
  ("rt_sigreturn", Some(173), Some(15)),
  ("rt_sigaction", Some(174), Some(13)),
  ("rt_sigprocmask", Some(175), Some(14)),
  ("pread64", Some(180), Some(17)),
  ("pwrite64", Some(181), Some(18)),
  ("getcwd", Some(183), Some(79)),
  ("sigaltstack", Some(186), Some(131)),
  ("vfork", Some(190), Some(58)),
  ("ugetrlimit", Some(191), None),
  ("mmap2", Some(192), None),
  ("stat64", Some(195), None),
  ("lstat64", Some(196), None),
  ("fstat64", Some(197), None),
  ("getuid32", Some(199), None),
  ("getgid32", Some(200), None),
  ("geteuid32", Some(201), None),
  ("getegid32", Some(202), None),
  ("madvise", Some(219), Some(28)),
  ("getdents64", Some(220), Some(217)),
  ("fcntl64", Some(221), None),
  ("gettid", Some(224), Some(186)),
  ("tkill", Some(238), Some(200)),
  ("futex", Some(240), Some(202)),
  ("set_thread_area", Some(243), Some(205)),
  ("exit_group", Some(252), Some(231)),
  ("set_tid_address", Some(258), Some(218)),
  ("clock_gettime", Some(265), Some(228)),
  ("clock_getres", Some(266), Some(229)),
  ("clock_nanosleep", Some(267), Some(230)),
  ("tgkill", Some(270), Some(234)),
  ("openat", Some(295), Some(257)),
  ("newfstatat", None, Some(262)),
  ("fstatat64", Some(300), None),
  ("readlinkat", Some(305), Some(267)),
  ("set_robust_list", Some(311), Some(273)),
  ("dup3", Some(330), Some(292)),
  ("pipe2", Some(331), Some(293)),
  ("prlimit64", Some(340), Some(302)),
  ("getrandom", Some(355), Some(318)),
  ("execveat", Some(358), Some(322)),
  ("socket", Some(359), Some(41)),
  ("statx", Some(383), Some(332)),
  ("arch_prctl", Some(384), Some(158)),
  ("rseq", Some(386), Some(334)),
  ("clock_gettime64", Some(403), None),
  ("clock_getres_time64", Some(406), None),
  ("clock_nanosleep_time64", Some(407), None),
  ("futex_time64", Some(422), None),
  ("clone3", Some(435), Some(435)),
];

lazy_static! {
  static ref NAMES: HashMap<(Arch, u32), &'static str> = {
    let mut map = HashMap::new();
    for &(name, x86, x86_64) in SYSCALL_TABLE {
      if let Some(nr) = x86 {
        map.insert((Arch::X86, nr), name);
      }
      if let Some(nr) = x86_64 {
        map.insert((Arch::X86_64, nr), name);
      }
    }
    map
  };
  static ref NUMBERS: HashMap<(Arch, &'static str), u32> = NAMES
    .iter()
    .map(|(&(arch, nr), &name)| ((arch, name), nr))
    .collect();
}

pub fn number(arch: Arch, name: &str) -> Option<u32> {
  NUMBERS.get(&(arch, name)).copied()
}

pub fn name(arch: Arch, nr: u32) -> Option<&'static str> {
  NAMES.get(&(arch, nr)).copied()
}

/// `socket`, or the bare number for calls missing from the table
pub fn display(arch: Arch, nr: u64) -> String {
  match u32::try_from(nr).ok().and_then(|nr| name(arch, nr)) {
    Some(name) => name.to_string(),
    None => nr.to_string(),
  }
}
