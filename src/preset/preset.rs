use std::path::Path;
use std::time::Duration;

use crate::utils::MemoryLimitType;

pub(crate) struct LanguagePreset {
  pub(crate) compile: CompileOption,
  pub(crate) execute: ExecuteCommand,
}

pub(crate) struct CompileOption {
  pub(crate) commands: Vec<ExecuteCommand>,
}

/// A command line with `${source}` / `${executable}` placeholders
pub(crate) struct ExecuteCommand {
  program: String,
  arguments: Vec<String>,
  time_limit: Duration,
  memory_limit: Option<MemoryLimitType>,
  env: Vec<(String, String)>,
}

impl CompileOption {
  pub fn new() -> Self {
    CompileOption {
      commands: vec![],
    }
  }

  pub fn command(mut self, command: ExecuteCommand) -> Self {
    self.commands.push(command);
    self
  }
}

impl ExecuteCommand {
  pub(crate) fn new<PS: Into<String>, AS: Into<String>>(program: PS, arguments: Vec<AS>) -> Self {
    ExecuteCommand {
      program: program.into(),
      arguments: arguments.into_iter().map(|a| a.into()).collect(),
      time_limit: Duration::from_secs(1),
      memory_limit: None,
      env: vec![],
    }
  }

  pub(crate) fn default_time_limit(mut self, value: Duration) -> Self {
    self.time_limit = value;
    self
  }

  pub(crate) fn default_memory_limit(mut self, value: MemoryLimitType) -> Self {
    self.memory_limit = Some(value);
    self
  }

  pub(crate) fn append_env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    self.env.push((key.into(), value.into()));
    self
  }

  pub(crate) fn time_limit(&self) -> Duration {
    self.time_limit
  }

  pub(crate) fn memory_limit(&self) -> Option<MemoryLimitType> {
    self.memory_limit
  }

  pub(crate) fn env(&self) -> &[(String, String)] {
    &self.env
  }

  /// Program and arguments with the placeholders filled in
  pub(crate) fn resolve(&self, source: &Path, executable: &Path) -> (String, Vec<String>) {
    let source = source.to_string_lossy();
    let executable = executable.to_string_lossy();
    let fill = |text: &str| {
      text
        .replace("${source}", &source)
        .replace("${executable}", &executable)
    };
    (
      fill(&self.program),
      self.arguments.iter().map(|arg| fill(arg)).collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fill_placeholders() {
    let command = ExecuteCommand::new("gcc", vec!["${source}", "-o", "${executable}", "-O2"]);
    let (program, arguments) = command.resolve(Path::new("/tmp/a.c"), Path::new("/tmp/a.out"));
    assert_eq!(program, "gcc");
    assert_eq!(arguments, vec!["/tmp/a.c", "-o", "/tmp/a.out", "-O2"]);

    let command = ExecuteCommand::new::<&str, String>("${executable}", vec![]);
    let (program, arguments) = command.resolve(Path::new("/tmp/a.c"), Path::new("/tmp/a.out"));
    assert_eq!(program, "/tmp/a.out");
    assert!(arguments.is_empty());
  }
}
