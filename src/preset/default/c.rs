use std::time::Duration;

use lazy_static::lazy_static;

use crate::preset::preset::{CompileOption, ExecuteCommand, LanguagePreset};

lazy_static! {
  pub(crate) static ref C_PRESET: LanguagePreset = LanguagePreset {
    compile: CompileOption::new().command(
      ExecuteCommand::new(
        "gcc",
        vec![
          "${source}",
          "-o",
          "${executable}",
          "-Wall",
          "-Wextra",
          "-Wno-unused-result",
          "-static",
          "-lm",
          "-std=c17",
          "-O2",
          "-DONLINE_JUDGE",
        ]
      )
      .default_time_limit(Duration::from_secs(10))
      .default_memory_limit(1024 * 1024 * 1024)
      .append_env("LANG", "C")
    ),
    execute: ExecuteCommand::new::<&str, String>("${executable}", vec![]),
  };
}
