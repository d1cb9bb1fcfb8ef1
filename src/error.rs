use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::errno::Errno;

/// Minor errors are caught before any privileged work starts (bad arguments,
/// not running as root); everything else is major and aborts the invocation.
pub enum SandboxError {
  Cli(String),
  AlreadyExists(String),
  NotInitialized(String),
  Fork(String),
  Cgroup(String),
  Mount(String),
  Exec(String),
  Fs(String),
  Nix(Errno),
  Logger(FlexiLoggerError),
}

pub enum SandboxExit {
  Ok,
  Err(SandboxError),
}

impl SandboxError {
  pub fn cli<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Cli(msg.into())
  }

  pub fn fork<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Fork(msg.into())
  }

  pub fn cgroup<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Cgroup(msg.into())
  }

  pub fn mount<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Mount(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Exec(msg.into())
  }

  pub fn fs<MS: Into<String>>(msg: MS) -> SandboxError {
    SandboxError::Fs(msg.into())
  }

  /// Exit code reported to the caller: 1 for configuration errors, 2 for
  /// operational failures.
  pub fn exit_code(&self) -> u8 {
    match self {
      SandboxError::Cli(_) => 1,
      _ => 2,
    }
  }
}

impl Debug for SandboxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for SandboxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      SandboxError::Cli(msg) => f.write_str(msg),
      SandboxError::AlreadyExists(name) => {
        f.write_fmt(format_args!("Sandbox '{}' already exists.", name))
      }
      SandboxError::NotInitialized(name) => f.write_fmt(format_args!(
        "Sandbox '{}' has not been initialized yet; please run with --init first.",
        name
      )),
      SandboxError::Fork(msg) => f.write_fmt(format_args!("Fork error: {}", msg)),
      SandboxError::Cgroup(msg) => f.write_fmt(format_args!("Cgroup error: {}", msg)),
      SandboxError::Mount(msg) => f.write_fmt(format_args!("Mount error: {}", msg)),
      SandboxError::Exec(msg) => f.write_fmt(format_args!("Exec error: {}", msg)),
      SandboxError::Fs(msg) => f.write_fmt(format_args!("File system error: {}", msg)),
      SandboxError::Nix(errno) => f.write_fmt(format_args!("OS error: {}", errno)),
      SandboxError::Logger(err) => f.write_fmt(format_args!("Logger error: {}", err)),
    }
  }
}

impl From<Errno> for SandboxError {
  fn from(errno: Errno) -> Self {
    SandboxError::Nix(errno)
  }
}

impl From<std::io::Error> for SandboxError {
  fn from(err: std::io::Error) -> Self {
    SandboxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for SandboxError {
  fn from(err: FlexiLoggerError) -> Self {
    SandboxError::Logger(err)
  }
}

impl Error for SandboxError {}

impl Termination for SandboxExit {
  fn report(self) -> ExitCode {
    match self {
      SandboxExit::Ok => ExitCode::SUCCESS.report(),
      SandboxExit::Err(err) => {
        eprintln!("{}", err);
        ExitCode::from(err.exit_code())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cli_errors_are_minor() {
    assert_eq!(SandboxError::cli("bad flag").exit_code(), 1);
  }

  #[test]
  fn operational_errors_are_major() {
    assert_eq!(SandboxError::cgroup("missing controller").exit_code(), 2);
    assert_eq!(SandboxError::mount("bind failed").exit_code(), 2);
    assert_eq!(SandboxError::from(Errno::EPERM).exit_code(), 2);
    assert_eq!(SandboxError::AlreadyExists("b".into()).exit_code(), 2);
    assert_eq!(SandboxError::NotInitialized("b".into()).exit_code(), 2);
  }
}
