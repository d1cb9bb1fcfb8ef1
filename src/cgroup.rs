use std::fs;
use std::path::{Path, PathBuf};

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::cpuacct::CpuAcctController;
use cgroups_rs::memory::MemController;
use cgroups_rs::pid::PidController;
use cgroups_rs::{Cgroup, CgroupPid, Controller, MaxValue};
use log::{debug, info};
use nix::unistd::getpid;

use crate::context::ResourceLimits;
use crate::error::SandboxError;

/// The fixed controller set. The sandbox accounts CPU time, limits memory and
/// caps the number of processes; nothing else.
const CONTROLLERS: [&str; 3] = ["cpuacct", "memory", "pids"];

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// All sandboxes live under a shared `sandbox/` scope inside every controller.
const SCOPE: &str = "sandbox";

/// Handle on the per-sandbox cgroup hierarchies at
/// `/sys/fs/cgroup/<controller>/sandbox/<name>`. Created at `--init`,
/// destroyed at `--del`, attached to and read during `--run`.
pub struct SandboxCgroup {
  name: String,
  cgroup: Cgroup,
}

impl SandboxCgroup {
  /// Create the hierarchy for all three controllers. Creation is idempotent;
  /// anything other than already-exists surfaces as an error.
  pub fn create(name: &str) -> Result<Self, SandboxError> {
    let path = relative_path(name);
    debug!("Create cgroup {}", path);

    let hierarchy = cgroups_rs::hierarchies::auto();
    let cgroup = CgroupBuilder::new(&path)
      .set_specified_controllers(CONTROLLERS.iter().map(|c| c.to_string()).collect())
      .build(hierarchy)
      .map_err(|err| {
        SandboxError::cgroup(format!("failed to create cgroup '{}': {}", path, err))
      })?;

    Ok(SandboxCgroup {
      name: name.to_string(),
      cgroup,
    })
  }

  /// Open the hierarchy of an already-initialized sandbox without creating
  /// anything. Missing directories surface on the first control-file access.
  pub fn load(name: &str) -> Result<Self, SandboxError> {
    let path = relative_path(name);
    let hierarchy = cgroups_rs::hierarchies::auto();
    let cgroup = Cgroup::load(hierarchy, path.as_str());

    Ok(SandboxCgroup {
      name: name.to_string(),
      cgroup,
    })
  }

  /// Remove the (empty) hierarchy from all three controllers. A non-empty
  /// cgroup means a task is still attached, which is a leak; it is never
  /// skipped silently.
  pub fn delete(self) -> Result<(), SandboxError> {
    info!("Delete cgroup {}", relative_path(&self.name));
    self.cgroup.delete().map_err(|err| {
      SandboxError::cgroup(format!(
        "failed to delete cgroup '{}': {}",
        relative_path(&self.name),
        err
      ))
    })
  }

  /// Write the calling process into every controller's task list. Runs in the
  /// program process while `/sys` is still visible, before the root pivot.
  pub fn attach_current(&self) -> Result<(), SandboxError> {
    let pid = CgroupPid::from(getpid().as_raw() as u64);
    debug!("Attach pid {} to cgroup {}", pid.pid, relative_path(&self.name));

    self
      .cpuacct()?
      .add_task(&pid)
      .map_err(|err| SandboxError::cgroup(format!("failed to attach to cpuacct: {}", err)))?;
    self
      .memory()?
      .add_task(&pid)
      .map_err(|err| SandboxError::cgroup(format!("failed to attach to memory: {}", err)))?;
    self
      .pids()?
      .add_task(&pid)
      .map_err(|err| SandboxError::cgroup(format!("failed to attach to pids: {}", err)))?;

    Ok(())
  }

  /// Apply the configured limits. Unconfigured dimensions stay at the system
  /// default, i.e. unlimited.
  pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<(), SandboxError> {
    if let Some(memory_kb) = limits.memory_kb {
      let bytes = (memory_kb as i64) << 10;
      let memory = self.memory()?;
      memory
        .set_limit(bytes)
        .map_err(|err| SandboxError::cgroup(format!("failed to set memory limit: {}", err)))?;
      memory.set_memswap_limit(bytes).map_err(|err| {
        SandboxError::cgroup(format!("failed to set memory+swap limit: {}", err))
      })?;
    }

    if let Some(max_pids) = limits.max_pids {
      self
        .pids()?
        .set_pid_max(MaxValue::Value(max_pids as i64))
        .map_err(|err| SandboxError::cgroup(format!("failed to set pids limit: {}", err)))?;
    }

    Ok(())
  }

  /// Zero the CPU-time counter so each run starts from a clean accumulator.
  pub fn reset_cpu_usage(&self) -> Result<(), SandboxError> {
    self
      .cpuacct()?
      .reset()
      .map_err(|err| SandboxError::cgroup(format!("failed to reset cpuacct.usage: {}", err)))
  }

  /// Accumulated CPU nanoseconds of every task ever attached this run.
  pub fn cpu_time_ns(&self) -> Result<u64, SandboxError> {
    let text = self.read_control("cpuacct", "cpuacct.usage")?;
    parse_counter(&text, "cpuacct.usage")
  }

  /// High-water mark of combined memory+swap usage, in kibibytes.
  pub fn peak_memory_kb(&self) -> Result<u64, SandboxError> {
    let text = self.read_control("memory", "memory.memsw.max_usage_in_bytes")?;
    Ok(parse_counter(&text, "memory.memsw.max_usage_in_bytes")? >> 10)
  }

  /// Whether the kernel's OOM killer fired inside this cgroup.
  pub fn oom_killed(&self) -> Result<bool, SandboxError> {
    let report = self.read_control("memory", "memory.oom_control")?;
    Ok(parse_oom_kill(&report)? > 0)
  }

  fn cpuacct(&self) -> Result<&CpuAcctController, SandboxError> {
    self
      .cgroup
      .controller_of()
      .ok_or_else(|| SandboxError::cgroup("cpuacct controller is not mounted"))
  }

  fn memory(&self) -> Result<&MemController, SandboxError> {
    self
      .cgroup
      .controller_of()
      .ok_or_else(|| SandboxError::cgroup("memory controller is not mounted"))
  }

  fn pids(&self) -> Result<&PidController, SandboxError> {
    self
      .cgroup
      .controller_of()
      .ok_or_else(|| SandboxError::cgroup("pids controller is not mounted"))
  }

  /// Read a control file directly. The kernel reports usage through these
  /// files; a missing or unreadable file must surface as an error, never as a
  /// zero reading.
  fn read_control(&self, controller: &str, file: &str) -> Result<String, SandboxError> {
    let path = control_path(&self.name, controller, file);
    let text = fs::read_to_string(&path).map_err(|err| {
      SandboxError::cgroup(format!("failed to read '{}': {}", path.display(), err))
    })?;
    Ok(text.trim_end_matches('\n').to_string())
  }
}

fn relative_path(name: &str) -> String {
  format!("{}/{}", SCOPE, name)
}

fn control_path(name: &str, controller: &str, file: &str) -> PathBuf {
  Path::new(CGROUP_ROOT)
    .join(controller)
    .join(SCOPE)
    .join(name)
    .join(file)
}

fn parse_counter(text: &str, file: &str) -> Result<u64, SandboxError> {
  text
    .trim()
    .parse::<u64>()
    .map_err(|_| SandboxError::cgroup(format!("unparsable value in '{}': {:?}", file, text)))
}

/// Scan the oom_control report for the `oom_kill <n>` counter. The token is
/// absent on kernels that predate it, which counts as zero.
fn parse_oom_kill(report: &str) -> Result<u64, SandboxError> {
  for line in report.lines() {
    if let Some((key, value)) = line.split_once(' ') {
      if key == "oom_kill" {
        return value.trim().parse::<u64>().map_err(|_| {
          SandboxError::cgroup(format!("unparsable oom_kill counter: {:?}", value))
        });
      }
    }
  }
  Ok(0)
}
