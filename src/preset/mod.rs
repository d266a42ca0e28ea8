use std::collections::HashMap;
use std::env;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use path_absolutize::Absolutize;

use crate::error::SimBoxError;
use crate::judge::Executable;
use crate::options::{RunOptions, Stdio};
use crate::preset::default::{CPP_PRESET, C_PRESET};
use crate::preset::preset::LanguagePreset;
use crate::spawner::spawn;
use crate::utils::MemoryLimitType;

mod default;
mod preset;

lazy_static! {
  static ref DETECT_LANGUAGE_MAP: HashMap<&'static str, &'static str> = {
    let mut map = HashMap::new();
    map.insert("c", "c");
    map.insert("cc", "cpp");
    map.insert("c++", "cpp");
    map.insert("cpp", "cpp");
    map.insert("cxx", "cpp");
    map
  };
}

/// Limits for the compiler; `None` falls back to the preset's defaults
#[derive(Debug, Clone, PartialEq)]
pub struct CompileLimits {
  pub time_limit: Option<Duration>,
  pub memory_limit: Option<MemoryLimitType>,
  /// Longest diagnostics kept in the error
  pub max_errors_len: u64,
}

impl Default for CompileLimits {
  fn default() -> Self {
    CompileLimits {
      time_limit: None,
      memory_limit: None,
      max_errors_len: 64 * 1024,
    }
  }
}

pub fn detect_language(language: Option<&str>, source: &Path) -> Option<String> {
  if let Some(language) = language {
    return if let Some(language) = DETECT_LANGUAGE_MAP.get(language) {
      Some(language.to_string())
    } else {
      Some(language.to_string())
    };
  }

  let ext = source.extension()?.to_str()?;
  DETECT_LANGUAGE_MAP.get(ext).map(|v| v.to_string())
}

fn find_preset(language: &str) -> Option<&'static LanguagePreset> {
  match language {
    "c" => Some(&*C_PRESET),
    "cpp" => Some(&*CPP_PRESET),
    _ => None,
  }
}

/// Look `program` up in `$PATH` unless it already names a path
fn find_program(program: &str) -> Option<PathBuf> {
  if program.contains('/') {
    return Some(PathBuf::from(program));
  }
  let path = env::var_os("PATH")?;
  env::split_paths(&path)
    .map(|dir| dir.join(program))
    .find(|candidate| candidate.is_file())
}

/// Compile `source` into `executable` with the preset of `language` (detected from the
/// extension when missing), returning how to run the result.
///
/// Failure carries the compiler diagnostics, cut to `max_errors_len` bytes.
pub fn compile(
  language: Option<&str>,
  source: &Path,
  executable: &Path,
  limits: &CompileLimits,
) -> Result<Executable, SimBoxError> {
  let language = detect_language(language, source)
    .ok_or_else(|| SimBoxError::cli("Can not detect submission language"))?;
  let preset = find_preset(&language)
    .ok_or_else(|| SimBoxError::cli(format!("Unsupported language {}", language)))?;
  let source = source.absolutize()?.to_path_buf();
  let executable = executable.absolutize()?.to_path_buf();

  info!(
    "Compile {} ({}) -> {}",
    source.to_string_lossy(),
    language,
    executable.to_string_lossy()
  );
  for command in preset.compile.commands.iter() {
    let (program, arguments) = command.resolve(&source, &executable);
    let program = find_program(&program)
      .ok_or_else(|| SimBoxError::compile(format!("{} is not installed", program)))?;

    let mut errors = tempfile::tempfile()?;
    let mut options = RunOptions::new()
      .time_limit(limits.time_limit.unwrap_or(command.time_limit()))
      .stdin(Stdio::Close)
      .stdout(Stdio::file(errors.try_clone()?))
      .stderr(Stdio::file(errors.try_clone()?))
      .env("PATH", env::var("PATH").unwrap_or_default())
      .envs(command.env().to_vec());
    if let Some(memory_limit) = limits.memory_limit.or(command.memory_limit()) {
      options = options.memory_limit(memory_limit);
    }

    let report = spawn(&program, &arguments, options, |_| {})?;
    if !report.is_success() {
      let mut diagnostics = vec![];
      errors.seek(SeekFrom::Start(0))?;
      (&mut errors)
        .take(limits.max_errors_len)
        .read_to_end(&mut diagnostics)?;
      let diagnostics = String::from_utf8_lossy(&diagnostics).into_owned();
      warn!("Compiler {} {}", program.to_string_lossy(), report.description());
      return Err(SimBoxError::compile(if diagnostics.trim().is_empty() {
        report.description()
      } else {
        diagnostics
      }));
    }
  }

  let (program, arguments) = preset.execute.resolve(&source, &executable);
  Ok(
    arguments
      .into_iter()
      .fold(Executable::new(program), |executable, arg| executable.arg(arg)),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detect_from_name_or_extension() {
    assert_eq!(detect_language(Some("c++"), Path::new("a.txt")), Some("cpp".to_string()));
    assert_eq!(detect_language(Some("rust"), Path::new("a.rs")), Some("rust".to_string()));
    assert_eq!(detect_language(None, Path::new("/tmp/main.cc")), Some("cpp".to_string()));
    assert_eq!(detect_language(None, Path::new("main.c")), Some("c".to_string()));
    assert_eq!(detect_language(None, Path::new("main")), None);
    assert_eq!(detect_language(None, Path::new("main.py")), None);
  }

  #[test]
  fn unknown_language_is_rejected() {
    let err = compile(
      Some("brainfuck"),
      Path::new("a.bf"),
      Path::new("a.out"),
      &CompileLimits::default(),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "SimBox CLI Error: Unsupported language brainfuck");
  }

  #[test]
  fn find_program_in_path() {
    assert_eq!(find_program("/bin/sh"), Some(PathBuf::from("/bin/sh")));
    assert!(find_program("sh").is_some());
    assert_eq!(find_program("definitely-not-a-compiler-42"), None);
  }
}
