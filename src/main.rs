use std::env;
use std::io;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::info;
use nix::unistd::{Gid, Uid};

use sandj::{default_format, ResourceLimits, Sandbox, SandboxError, SandboxExit};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
  /// Create the sandbox
  #[arg(long)]
  init: bool,

  /// Execute COMMAND inside the sandbox and print the result record
  #[arg(long)]
  run: bool,

  /// Remove the sandbox
  #[arg(long)]
  del: bool,

  /// Sandbox name
  #[arg(long)]
  box_name: String,

  /// Directory the sandbox lives under
  #[arg(long)]
  box_root: PathBuf,

  /// Memory limit in KB (0 = unlimited)
  #[arg(long, default_value_t = 0)]
  memory_limit: u64,

  /// Maximum number of processes (0 = unlimited)
  #[arg(long, default_value_t = 0)]
  max_pids: u64,

  /// Maximum size of a created file in KB (0 = unlimited)
  #[arg(long, default_value_t = 0)]
  max_fsize: u64,

  /// CPU time limit in milliseconds (0 = unlimited)
  #[arg(long, default_value_t = 0)]
  cpu_time_limit: u64,

  /// Real time limit in milliseconds (0 = unlimited)
  #[arg(long, default_value_t = 0)]
  real_time_limit: u64,

  /// Command to execute, after `--`
  #[arg(last = true)]
  command: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum Mode {
  Init,
  Run,
  Del,
}

impl Cli {
  fn mode(&self) -> Result<Mode, SandboxError> {
    match (self.init, self.run, self.del) {
      (true, false, false) => Ok(Mode::Init),
      (false, true, false) => Ok(Mode::Run),
      (false, false, true) => Ok(Mode::Del),
      (false, false, false) => Err(SandboxError::cli(
        "Please specify a mode (--init/--run/--del).",
      )),
      _ => Err(SandboxError::cli(
        "Please specify a single mode (--init/--run/--del).",
      )),
    }
  }

  fn limits(&self) -> ResourceLimits {
    let mut limits = ResourceLimits::new();
    limits
      .memory_kb(self.memory_limit)
      .max_pids(self.max_pids)
      .max_fsize_kb(self.max_fsize)
      .cpu_time_limit_ms(self.cpu_time_limit)
      .real_time_limit_ms(self.real_time_limit);
    limits
  }
}

fn main() -> SandboxExit {
  match try_main() {
    Ok(_) => SandboxExit::Ok,
    Err(err) => SandboxExit::Err(err),
  }
}

fn try_main() -> Result<(), SandboxError> {
  let cli = match Cli::try_parse() {
    Ok(cli) => cli,
    Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
      let _ = err.print();
      return Ok(());
    }
    Err(err) => return Err(SandboxError::cli(err.to_string())),
  };

  if !Uid::current().is_root() || Gid::current().as_raw() != 0 {
    return Err(SandboxError::cli("You must run this program as root."));
  }

  let mode = cli.mode()?;

  setup_logger()?;
  info!("Start sandj ({:?} '{}')", mode, cli.box_name);

  let sandbox = Sandbox::new(&cli.box_name, &cli.box_root)?;

  match mode {
    Mode::Init => {
      sandbox.init()?;
      println!("Sandbox was successfully initialized!");
    }
    Mode::Run => {
      let result = sandbox.run(&cli.limits(), &cli.command)?;
      result.write_record(&mut io::stdout())?;
    }
    Mode::Del => {
      sandbox.delete()?;
      println!("Sandbox was successfully deleted!");
    }
  }

  Ok(())
}

fn setup_logger() -> Result<(), SandboxError> {
  Logger::try_with_str("sandj=info")?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("sandj")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .start()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args.iter().copied()).unwrap()
  }

  #[test]
  fn run_mode_takes_the_trailing_command() {
    let cli = parse(&[
      "sandj", "--run", "--box-name", "main", "--box-root", "/var/box", "--cpu-time-limit",
      "1000", "--", "/bin/sh", "-c", "exit 7",
    ]);
    assert_eq!(cli.mode().unwrap(), Mode::Run);
    assert_eq!(cli.command, vec!["/bin/sh", "-c", "exit 7"]);
  }

  #[test]
  fn limit_options_default_to_zero() {
    let cli = parse(&["sandj", "--init", "--box-name", "main", "--box-root", "/var/box"]);
    assert_eq!(cli.memory_limit, 0);
    assert_eq!(cli.max_pids, 0);
    assert_eq!(cli.max_fsize, 0);
    assert_eq!(cli.cpu_time_limit, 0);
    assert_eq!(cli.real_time_limit, 0);
    assert!(cli.command.is_empty());
  }

  #[test]
  fn modes_are_mutually_exclusive() {
    let cli = parse(&[
      "sandj", "--init", "--del", "--box-name", "main", "--box-root", "/var/box",
    ]);
    assert!(matches!(cli.mode(), Err(SandboxError::Cli(_))));
  }

  #[test]
  fn a_mode_is_required() {
    let cli = parse(&["sandj", "--box-name", "main", "--box-root", "/var/box"]);
    assert!(matches!(cli.mode(), Err(SandboxError::Cli(_))));
  }

  #[test]
  fn box_name_and_root_are_required() {
    assert!(Cli::try_parse_from(["sandj", "--init"]).is_err());
  }
}
