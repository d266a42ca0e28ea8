use std::path::{Path, PathBuf};

use log::debug;

use crate::error::SimBoxError;
use crate::judge::Suite;
use crate::options::{AllowedFile, RunOptions};
use crate::report::ExitReport;
use crate::sandbox::Sandbox;
use crate::spawner::spawn;

/// A built program: an executable plus the arguments that always come first.
///
/// Sandboxed by default. Trusted interpreters (a checker written as a shell script, say) can
/// opt out and run under the resource limits alone.
#[derive(Debug, Clone)]
pub struct Executable {
  path: PathBuf,
  args_prefix: Vec<String>,
  sandboxed: bool,
}

impl Executable {
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Executable {
      path: path.into(),
      args_prefix: vec![],
      sandboxed: true,
    }
  }

  /// Append a fixed argument, passed before the per-run ones
  pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
    self.args_prefix.push(arg.into());
    self
  }

  pub fn sandboxed(mut self, flag: bool) -> Self {
    self.sandboxed = flag;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn is_sandboxed(&self) -> bool {
    self.sandboxed
  }
}

impl Suite for Executable {
  fn run(
    &self,
    args: &[String],
    options: RunOptions,
    allowed_files: &[AllowedFile],
  ) -> Result<ExitReport, SimBoxError> {
    let args = self
      .args_prefix
      .iter()
      .chain(args.iter())
      .cloned()
      .collect::<Vec<String>>();
    if self.sandboxed {
      Sandbox::new().run(&self.path, &args, options, allowed_files)
    } else {
      debug!("Run {} without syscall filter", self.path.to_string_lossy());
      spawn(&self.path, &args, options, |_| {})
    }
  }
}
