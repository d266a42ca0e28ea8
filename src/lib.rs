//! Run untrusted programs under resource limits and a seccomp + ptrace sandbox, and judge
//! them against a checker.
//!
//! Time limits are enforced by POSIX timers signalling the host with `SIGRTMIN`. The first run
//! takes over the process wide handler of that signal for good.

pub use error::{SimBoxError, SimBoxExit};
pub use judge::{
  parse_checker_output, test_on_interactive_test, test_on_test, CheckerLimits, CheckerVerdict,
  Executable, InteractiveTestArgs, ProgramLimits, RunStats, Suite, TestArgs, TestReport,
  TestStatus,
};
pub use options::{AllowedFile, KillHandle, OpenAccess, ResourceLimits, RunOptions, Stdio};
pub use preset::{compile, detect_language, CompileLimits};
pub use report::{ExitReport, Termination};
pub use sandbox::{Sandbox, MEMORY_LIMIT_EXCEEDED};
pub use spawner::spawn;
pub use utils::{default_format, parse_env, MemoryLimitType};

mod error;
mod judge;
mod options;
mod pipe;
mod preset;
mod report;
pub mod sandbox;
mod spawner;
mod timer;
mod utils;
