use std::env;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{error, info};
use nix::libc::STDOUT_FILENO;
use nix::unistd::isatty;

use simbox::{
  compile, default_format, parse_env, spawn, test_on_interactive_test, test_on_test,
  AllowedFile, CheckerLimits, CompileLimits, Executable, ExitReport, InteractiveTestArgs,
  OpenAccess, ProgramLimits, RunOptions, Sandbox, SimBoxError, SimBoxExit, Stdio, TestArgs,
  TestReport,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short, long, global = true, help = "Wall time limit (unit: ms) [default: 1000]")]
  time: Option<u64>,

  #[arg(long, global = true, help = "CPU time limit (unit: ms) [default: wall time limit]")]
  cpu_time: Option<u64>,

  #[arg(short, long, global = true, help = "Memory limit (unit: KB) [default: 262144]")]
  memory: Option<u64>,

  #[arg(long, global = true, help = "Output size limit (unit: KB) [default: 65536]")]
  output_size: Option<u64>,

  #[arg(long, global = true, help = "Working directory of the program")]
  cwd: Option<PathBuf>,

  #[arg(short, long, global = true, help = "Pass environment variable (KEY=VALUE or KEY)")]
  env: Vec<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run a program under the sandbox")]
  Run {
    #[arg(long, help = "Only apply resource limits, without syscall filter")]
    unrestricted: bool,

    #[arg(long, help = "Redirect stdin from file")]
    stdin: Option<PathBuf>,

    #[arg(long, help = "Redirect stdout to file")]
    stdout: Option<PathBuf>,

    #[arg(long, help = "Redirect stderr to file")]
    stderr: Option<PathBuf>,

    #[arg(long, help = "Allow opening the path read only")]
    allow_read: Vec<PathBuf>,

    #[arg(long, help = "Allow opening the path write only")]
    allow_write: Vec<PathBuf>,

    #[arg(long, help = "Allow opening the path read write")]
    allow_rw: Vec<PathBuf>,

    #[arg(help = "Program")]
    program: PathBuf,

    #[arg(help = "Arguments", trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
  },

  #[command(about = "Judge a program on one test with a checker")]
  Test {
    #[command(flatten)]
    checker: CheckerArgs,

    #[arg(long, help = "Test input")]
    input: PathBuf,

    #[arg(long, help = "Expected output")]
    expected: PathBuf,

    #[arg(help = "Program")]
    program: PathBuf,
  },

  #[command(about = "Judge a program interacting with a checker")]
  Interactive {
    #[command(flatten)]
    checker: CheckerArgs,

    #[arg(long, help = "Test input, passed to the checker")]
    input: PathBuf,

    #[arg(help = "Program")]
    program: PathBuf,
  },

  #[command(about = "Compile source code with a language preset")]
  Compile {
    #[arg(short, long, help = "Language, detected from the extension by default")]
    language: Option<String>,

    #[arg(short, long, help = "Output executable")]
    output: PathBuf,

    #[arg(help = "Source file")]
    source: PathBuf,
  },
}

#[derive(clap::Args, Debug)]
struct CheckerArgs {
  #[arg(long, help = "Checker executable")]
  checker: PathBuf,

  #[arg(long, help = "Run the checker without syscall filter")]
  trusted_checker: bool,

  #[arg(long, default_value_t = 10000, help = "Checker time limit (unit: ms)")]
  checker_time: u64,

  #[arg(long, default_value_t = 262144, help = "Checker memory limit (unit: KB)")]
  checker_memory: u64,

  #[arg(long, default_value_t = 512, help = "Longest checker comment kept (unit: bytes)")]
  comment_len: usize,
}

impl CheckerArgs {
  fn suite(&self) -> Executable {
    Executable::new(&self.checker).sandboxed(!self.trusted_checker)
  }

  fn limits(&self) -> CheckerLimits {
    CheckerLimits {
      time_limit: Duration::from_millis(self.checker_time),
      cpu_time_limit: Duration::from_millis(self.checker_time),
      memory_limit: self.checker_memory * 1024,
      max_comment_len: self.comment_len,
    }
  }
}

fn open_read(path: &Path) -> Result<Stdio, SimBoxError> {
  let file = File::open(path)
    .map_err(|err| SimBoxError::fs(format!("open {}: {}", path.to_string_lossy(), err)))?;
  Ok(Stdio::file(file))
}

fn open_write(path: &Path) -> Result<Stdio, SimBoxError> {
  let file = OpenOptions::new()
    .write(true)
    .create(true)
    .truncate(true)
    .open(path)
    .map_err(|err| SimBoxError::fs(format!("open {}: {}", path.to_string_lossy(), err)))?;
  Ok(Stdio::file(file))
}

fn is_tty() -> bool {
  isatty(STDOUT_FILENO).unwrap_or(false)
}

fn print_exit_report(report: &ExitReport) {
  if is_tty() {
    report.report_human();
  } else {
    println!("{}", report.to_json());
  }
}

fn print_test_report(report: &TestReport) {
  if is_tty() {
    report.report_human();
  } else {
    println!("{}", report.to_json());
  }
}

impl Cli {
  fn program_limits(&self) -> ProgramLimits {
    let time = self.time.unwrap_or(1000);
    ProgramLimits {
      time_limit: Duration::from_millis(time),
      cpu_time_limit: Duration::from_millis(self.cpu_time.unwrap_or(time)),
      memory_limit: self.memory.unwrap_or(262144) * 1024,
      output_size_limit: self.output_size.unwrap_or(65536) * 1024,
    }
  }

  fn run_options(&self) -> Result<RunOptions, SimBoxError> {
    let limits = self.program_limits();
    let mut options = RunOptions::new()
      .time_limit(limits.time_limit)
      .cpu_time_limit(limits.cpu_time_limit)
      .memory_limit(limits.memory_limit)
      .max_output_size(limits.output_size_limit);
    if let Some(cwd) = &self.cwd {
      options = options.working_directory(cwd);
    }
    for text in self.env.iter() {
      let (key, value) = parse_env(text.clone())?;
      options = options.env(key, value);
    }
    Ok(options)
  }

  fn execute(self) -> Result<(), SimBoxError> {
    match &self.command {
      Commands::Run {
        unrestricted,
        stdin,
        stdout,
        stderr,
        allow_read,
        allow_write,
        allow_rw,
        program,
        arguments,
      } => {
        let mut options = self.run_options()?;
        if let Some(path) = stdin {
          options = options.stdin(open_read(path)?);
        }
        if let Some(path) = stdout {
          options = options.stdout(open_write(path)?);
        }
        if let Some(path) = stderr {
          options = options.stderr(open_write(path)?);
        }

        let report = if *unrestricted {
          spawn(program, arguments, options, |_| {})?
        } else {
          let mut allowed_files = vec![];
          for (paths, access) in [
            (allow_read, OpenAccess::ReadOnly),
            (allow_write, OpenAccess::WriteOnly),
            (allow_rw, OpenAccess::ReadWrite),
          ] {
            allowed_files.extend(paths.iter().map(|path| AllowedFile::new(path, access)));
          }
          Sandbox::new().run(program, arguments, options, &allowed_files)?
        };
        print_exit_report(&report);
        Ok(())
      }
      Commands::Test {
        checker,
        input,
        expected,
        program,
      } => {
        let program = Executable::new(program);
        let checker_suite = checker.suite();
        let report = test_on_test(TestArgs {
          program: &program,
          checker: &checker_suite,
          test_input: input,
          expected_output: expected,
          program_limits: self.program_limits(),
          checker_limits: checker.limits(),
        })?;
        print_test_report(&report);
        Ok(())
      }
      Commands::Interactive {
        checker,
        input,
        program,
      } => {
        let program = Executable::new(program);
        let checker_suite = checker.suite();
        let report = test_on_interactive_test(InteractiveTestArgs {
          program: &program,
          checker: &checker_suite,
          test_input: input,
          program_limits: self.program_limits(),
          checker_limits: checker.limits(),
        })?;
        print_test_report(&report);
        Ok(())
      }
      Commands::Compile {
        language,
        output,
        source,
      } => {
        let limits = CompileLimits {
          time_limit: self.time.map(Duration::from_millis),
          memory_limit: self.memory.map(|memory| memory * 1024),
          ..CompileLimits::default()
        };
        let executable = compile(language.as_deref(), source, output, &limits)?;
        info!("Compiled into {}", executable.path().to_string_lossy());
        Ok(())
      }
    }
  }
}

fn start_logger() -> Result<(), SimBoxError> {
  Logger::try_with_str("simbox=info")?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("simbox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .start()?;
  Ok(())
}

fn main() -> SimBoxExit {
  let cli = Cli::parse();

  if let Err(err) = start_logger() {
    return SimBoxExit::Err(err);
  }

  info!("Start running simbox");
  match cli.execute() {
    Ok(()) => {
      info!("Running simbox finished");
      SimBoxExit::Ok
    }
    Err(err) => {
      error!("Running simbox failed: {}", err);
      SimBoxExit::Err(err)
    }
  }
}
