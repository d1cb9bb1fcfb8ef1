use std::fs::{create_dir, set_permissions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::info;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Uid};
use path_absolutize::Absolutize;

use crate::cgroup::SandboxCgroup;
use crate::error::SandboxError;
use crate::utils::chown_recursive;

/// A named sandbox rooted at `<root>/<name>`. The box directory's existence
/// is the authoritative lifecycle state: it exists iff the sandbox is
/// initialized and not yet deleted.
pub struct Sandbox {
  name: String,
  root: PathBuf,
}

/// Per-run resource limits. Zero or absent means unlimited for that
/// dimension; the setters normalize in one place.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
  pub(crate) memory_kb: Option<u64>,
  pub(crate) max_pids: Option<u64>,
  pub(crate) max_fsize_kb: Option<u64>,
  pub(crate) cpu_time_limit_ns: Option<u64>,
  pub(crate) real_time_limit_ns: Option<u64>,
}

/// Outcome of one sandboxed execution. `exitcode` and `signal` are mutually
/// exclusive and both absent after a timeout; `oom_kill` is observed
/// independently of how the program ended.
pub struct SandboxResult {
  pub cpu_time_ns: u64,
  pub real_time_ns: u64,
  pub memory_kb: u64,
  pub timeout: bool,
  pub oom_kill: bool,
  pub exitcode: Option<i32>,
  pub signal: Option<Signal>,
}

impl Sandbox {
  pub fn new<NS: Into<String>, RP: AsRef<Path>>(
    name: NS,
    root: RP,
  ) -> Result<Self, SandboxError> {
    let root = root.as_ref().absolutize()?.to_path_buf();
    Ok(Sandbox {
      name: name.into(),
      root,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn box_path(&self) -> PathBuf {
    self.root.join(&self.name)
  }

  pub fn is_initialized(&self) -> bool {
    self.box_path().exists()
  }

  /// Create the box directory, the persistent `box/` user area and the three
  /// cgroup hierarchies.
  pub fn init(&self) -> Result<(), SandboxError> {
    let box_path = self.box_path();
    match create_dir(&box_path) {
      Ok(_) => {}
      Err(err) if err.kind() == ErrorKind::AlreadyExists => {
        return Err(SandboxError::AlreadyExists(self.name.clone()));
      }
      Err(err) => {
        return Err(SandboxError::fs(format!("failed to initialize box: {}", err)));
      }
    }

    let user_dir = box_path.join("box");
    create_dir(&user_dir)
      .map_err(|err| SandboxError::fs(format!("failed to create 'box' directory: {}", err)))?;
    set_permissions(&user_dir, Permissions::from_mode(0o777))
      .map_err(|err| SandboxError::fs(format!("failed to chmod 'box' directory: {}", err)))?;

    SandboxCgroup::create(&self.name)?;

    info!("Sandbox '{}' initialized at {}", self.name, box_path.display());
    Ok(())
  }

  /// Execute `command` inside the sandbox under `limits` and trace it to
  /// completion.
  pub fn run(
    &self,
    limits: &ResourceLimits,
    command: &[String],
  ) -> Result<SandboxResult, SandboxError> {
    if !self.is_initialized() {
      return Err(SandboxError::NotInitialized(self.name.clone()));
    }
    if command.is_empty() {
      return Err(SandboxError::cli("No command to run; pass it after '--'."));
    }

    // A previous run leaves root-owned files behind; normalize ownership so
    // nothing blocks this run or the eventual cleanup.
    chown_recursive(&self.box_path(), Uid::current(), Gid::current())?;

    crate::sandbox::run(self, limits, command)
  }

  /// Remove the box directory and the cgroup hierarchies.
  pub fn delete(&self) -> Result<(), SandboxError> {
    if !self.is_initialized() {
      return Err(SandboxError::NotInitialized(self.name.clone()));
    }

    remove_dir_all::remove_dir_all(self.box_path())
      .map_err(|err| SandboxError::fs(format!("failed to delete box: {}", err)))?;
    SandboxCgroup::load(&self.name)?.delete()?;

    info!("Sandbox '{}' deleted", self.name);
    Ok(())
  }
}

impl ResourceLimits {
  pub fn new() -> Self {
    ResourceLimits::default()
  }

  pub fn memory_kb(self: &mut Self, kb: u64) -> &mut Self {
    self.memory_kb = nonzero(kb);
    self
  }

  pub fn max_pids(self: &mut Self, count: u64) -> &mut Self {
    self.max_pids = nonzero(count);
    self
  }

  pub fn max_fsize_kb(self: &mut Self, kb: u64) -> &mut Self {
    self.max_fsize_kb = nonzero(kb);
    self
  }

  pub fn cpu_time_limit_ms(self: &mut Self, ms: u64) -> &mut Self {
    self.cpu_time_limit_ns = nonzero(ms.saturating_mul(1_000_000));
    self
  }

  pub fn real_time_limit_ms(self: &mut Self, ms: u64) -> &mut Self {
    self.real_time_limit_ns = nonzero(ms.saturating_mul(1_000_000));
    self
  }
}

impl SandboxResult {
  /// Emit the record consumed by the grading pipeline: one `key: value` line
  /// per field, every value an integer, `-1` standing in for an absent exit
  /// code or signal.
  pub fn write_record<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
    writeln!(w, "cpu_time_ns: {}", self.cpu_time_ns)?;
    writeln!(w, "real_time_ns: {}", self.real_time_ns)?;
    writeln!(w, "memory_kb: {}", self.memory_kb)?;
    writeln!(w, "timeout: {}", self.timeout as i32)?;
    writeln!(w, "oom_kill: {}", self.oom_kill as i32)?;
    writeln!(w, "exitcode: {}", self.exitcode.unwrap_or(-1))?;
    writeln!(w, "signal: {}", self.signal.map(|s| s as i32).unwrap_or(-1))?;
    Ok(())
  }
}

fn nonzero(value: u64) -> Option<u64> {
  if value > 0 {
    Some(value)
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_limits_mean_unlimited() {
    let mut limits = ResourceLimits::new();
    limits
      .memory_kb(0)
      .max_pids(0)
      .max_fsize_kb(0)
      .cpu_time_limit_ms(0)
      .real_time_limit_ms(0);
    assert!(limits.memory_kb.is_none());
    assert!(limits.max_pids.is_none());
    assert!(limits.max_fsize_kb.is_none());
    assert!(limits.cpu_time_limit_ns.is_none());
    assert!(limits.real_time_limit_ns.is_none());
  }

  #[test]
  fn time_limits_convert_ms_to_ns() {
    let mut limits = ResourceLimits::new();
    limits.cpu_time_limit_ms(1000).real_time_limit_ms(2500);
    assert_eq!(limits.cpu_time_limit_ns, Some(1_000_000_000));
    assert_eq!(limits.real_time_limit_ns, Some(2_500_000_000));
  }

  #[test]
  fn record_prints_every_field_as_integer() {
    let result = SandboxResult {
      cpu_time_ns: 1_200_000,
      real_time_ns: 3_400_000,
      memory_kb: 256,
      timeout: false,
      oom_kill: false,
      exitcode: Some(7),
      signal: None,
    };
    let mut buf = Vec::new();
    result.write_record(&mut buf).unwrap();
    assert_eq!(
      String::from_utf8(buf).unwrap(),
      "cpu_time_ns: 1200000\nreal_time_ns: 3400000\nmemory_kb: 256\n\
       timeout: 0\noom_kill: 0\nexitcode: 7\nsignal: -1\n"
    );
  }

  #[test]
  fn timeout_record_leaves_exit_state_absent() {
    let result = SandboxResult {
      cpu_time_ns: 5_000_000_000,
      real_time_ns: 5_000_000_000,
      memory_kb: 64,
      timeout: true,
      oom_kill: false,
      exitcode: None,
      signal: None,
    };
    let mut buf = Vec::new();
    result.write_record(&mut buf).unwrap();
    let record = String::from_utf8(buf).unwrap();
    assert!(record.contains("timeout: 1\n"));
    assert!(record.contains("exitcode: -1\n"));
    assert!(record.contains("signal: -1\n"));
  }

  #[test]
  fn signal_record_uses_the_signal_number() {
    let result = SandboxResult {
      cpu_time_ns: 0,
      real_time_ns: 0,
      memory_kb: 0,
      timeout: false,
      oom_kill: true,
      exitcode: None,
      signal: Some(Signal::SIGKILL),
    };
    let mut buf = Vec::new();
    result.write_record(&mut buf).unwrap();
    let record = String::from_utf8(buf).unwrap();
    assert!(record.contains("oom_kill: 1\n"));
    assert!(record.contains("signal: 9\n"));
  }

  #[test]
  fn lifecycle_state_follows_the_box_directory() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Sandbox::new("main", dir.path()).unwrap();
    assert_eq!(sandbox.box_path(), dir.path().join("main"));
    assert!(!sandbox.is_initialized());

    std::fs::create_dir(dir.path().join("main")).unwrap();
    assert!(sandbox.is_initialized());
  }

  #[test]
  fn run_and_delete_require_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Sandbox::new("ghost", dir.path()).unwrap();

    let limits = ResourceLimits::new();
    let command = vec!["/bin/true".to_string()];
    assert!(matches!(
      sandbox.run(&limits, &command),
      Err(SandboxError::NotInitialized(_))
    ));
    assert!(matches!(
      sandbox.delete(),
      Err(SandboxError::NotInitialized(_))
    ));
  }
}
