use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use flexi_logger::Logger;
use log::warn;

use simbox::{compile, CompileLimits, Executable};

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("simbox=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// Write `body` as a shell script in `dir`, run by `/bin/sh` under the resource limits only
#[allow(dead_code)]
pub fn script(dir: &Path, name: &str, body: &str) -> Executable {
  let path = dir.join(name);
  fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
  Executable::new("/bin/sh")
    .arg(path.to_string_lossy())
    .sandboxed(false)
}

#[allow(dead_code)]
pub fn fixture(name: &str) -> PathBuf {
  Path::new(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Build `tests/fixtures/<name>.c` as a static binary, `None` when the host can not
#[allow(dead_code)]
pub fn compile_fixture(dir: &Path, name: &str) -> Option<PathBuf> {
  let source = fixture(&format!("{}.c", name));
  let executable = dir.join(name);
  match compile(Some("c"), &source, &executable, &CompileLimits::default()) {
    Ok(_) => Some(executable),
    Err(err) => {
      warn!("Skip fixture {}: {}", name, err);
      None
    }
  }
}
