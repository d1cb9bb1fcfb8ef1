use std::fs::{create_dir, remove_dir, set_permissions, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{debug, info};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, pivot_root};

use crate::error::SandboxError;
use crate::utils::write_file;

/// The sandboxed program must never resolve host identities beyond these.
const PASSWD: &str = "root:x:0:0:root:\nnobody:x:65534:65534:nobody:\n";
const GROUP: &str = "root:x:0:\nnogroup:x:65534:\n";

/// One entry of the fixed allow-list the sandbox root is populated from.
/// A `None` source mounts a fresh filesystem of `fstype` instead of binding a
/// host path. Everything is `MS_NODEV` unless `dev` is set, and read-only
/// unless `writable` is set.
struct BoxMount {
  source: Option<&'static str>,
  target: &'static str,
  fstype: Option<&'static str>,
  writable: bool,
  dev: bool,
}

const MOUNTS: &[BoxMount] = &[
  BoxMount { source: Some("box"), target: "box", fstype: None, writable: true, dev: false },
  BoxMount { source: Some("/bin"), target: "bin", fstype: None, writable: false, dev: false },
  BoxMount { source: Some("/lib"), target: "lib", fstype: None, writable: false, dev: false },
  BoxMount { source: Some("/lib64"), target: "lib64", fstype: None, writable: false, dev: false },
  BoxMount { source: Some("/usr/bin"), target: "usr/bin", fstype: None, writable: false, dev: false },
  BoxMount { source: Some("/usr/include"), target: "usr/include", fstype: None, writable: false, dev: false },
  BoxMount { source: Some("/usr/lib"), target: "usr/lib", fstype: None, writable: false, dev: false },
  BoxMount { source: None, target: "proc", fstype: Some("proc"), writable: false, dev: false },
  BoxMount { source: None, target: "tmp", fstype: Some("tmpfs"), writable: true, dev: false },
];

/// Fixed device nodes, all character devices, mode 0666.
const DEVICES: [(&str, u64, u64); 4] = [
  ("dev/null", 1, 3),
  ("dev/random", 1, 8),
  ("dev/urandom", 1, 9),
  ("dev/zero", 1, 5),
];

/// Construct the private root filesystem and pivot into it. Runs inside the
/// fresh mount namespace, before the privilege drop; afterwards nothing
/// outside the box path is reachable.
pub fn build(box_path: &Path) -> Result<(), SandboxError> {
  info!("Build sandbox root at {}", box_path.display());

  // Mount events must not propagate back to the host, and pivot_root needs
  // the new root to be a mount point of its own.
  mount::<str, Path, str, str>(
    None,
    Path::new("/"),
    None,
    MsFlags::MS_PRIVATE | MsFlags::MS_REC,
    None,
  )
  .map_err(|err| SandboxError::mount(format!("failed to make mounts private: {}", err)))?;

  mount::<Path, Path, str, str>(
    Some(box_path),
    box_path,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REC,
    None,
  )
  .map_err(|err| {
    SandboxError::mount(format!(
      "failed to bind '{}' onto itself: {}",
      box_path.display(),
      err
    ))
  })?;

  chdir(box_path)?;

  for entry in MOUNTS {
    populate(entry)?;
  }

  // Writable run directory; the redirected streams and the program's cwd
  // live here.
  ensure_dir("home", 0o777)?;

  ensure_dir("etc", 0o755)?;
  write_file("etc/passwd", PASSWD)?;
  set_permissions("etc/passwd", Permissions::from_mode(0o644))?;
  write_file("etc/group", GROUP)?;
  set_permissions("etc/group", Permissions::from_mode(0o644))?;

  ensure_dir("dev", 0o755)?;
  for (path, major, minor) in DEVICES {
    add_device(path, major, minor)?;
  }

  pivot()
}

/// Bind or mount a single allow-list entry under the box root, then clamp it
/// read-only unless flagged writable.
fn populate(entry: &BoxMount) -> Result<(), SandboxError> {
  std::fs::create_dir_all(entry.target)?;

  let mut flags = if entry.fstype.is_none() {
    MsFlags::MS_BIND | MsFlags::MS_REC
  } else {
    MsFlags::empty()
  };
  if !entry.dev {
    flags |= MsFlags::MS_NODEV;
  }

  debug!("Mount {:?} -> {}", entry.source, entry.target);
  mount::<str, str, str, str>(entry.source, entry.target, entry.fstype, flags, None).map_err(
    |err| SandboxError::mount(format!("failed to mount '{}': {}", entry.target, err)),
  )?;

  if !entry.writable {
    flags |= MsFlags::MS_RDONLY;
    mount::<str, str, str, str>(
      entry.source,
      entry.target,
      entry.fstype,
      flags | MsFlags::MS_REMOUNT,
      None,
    )
    .map_err(|err| {
      SandboxError::mount(format!(
        "failed to remount '{}' read-only: {}",
        entry.target, err
      ))
    })?;
  }

  // The new pid namespace would still be inspectable through a shared /proc;
  // hidepid additionally blinds the program to the supervisor.
  if entry.fstype == Some("proc") {
    mount::<str, str, str, str>(
      entry.source,
      entry.target,
      entry.fstype,
      flags | MsFlags::MS_REMOUNT,
      Some("hidepid=2"),
    )
    .map_err(|err| {
      SandboxError::mount(format!("failed to remount '/proc' with 'hidepid=2': {}", err))
    })?;
  }

  Ok(())
}

fn add_device(path: &str, major: u64, minor: u64) -> Result<(), SandboxError> {
  match mknod(
    path,
    SFlag::S_IFCHR,
    Mode::from_bits_truncate(0o666),
    makedev(major, minor),
  ) {
    Ok(_) => {}
    Err(Errno::EEXIST) => {}
    Err(errno) => {
      return Err(SandboxError::fs(format!(
        "failed to add device '{}': {}",
        path, errno
      )))
    }
  }
  // mknod is subject to the umask; the nodes must stay world-usable.
  set_permissions(path, Permissions::from_mode(0o666))?;
  Ok(())
}

fn ensure_dir(path: &str, mode: u32) -> Result<(), SandboxError> {
  match create_dir(path) {
    Ok(_) => {}
    Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
    Err(err) => {
      return Err(SandboxError::fs(format!(
        "failed to create '{}' directory: {}",
        path, err
      )))
    }
  }
  set_permissions(path, Permissions::from_mode(mode))?;
  Ok(())
}

/// Swap the process root onto the box mount and drop the old root from view.
fn pivot() -> Result<(), SandboxError> {
  ensure_dir("put_old", 0o777)?;
  pivot_root(".", "put_old")
    .map_err(|err| SandboxError::mount(format!("failed to pivot root: {}", err)))?;
  chdir("/")?;
  umount2("put_old", MntFlags::MNT_DETACH)
    .map_err(|err| SandboxError::mount(format!("failed to detach old root: {}", err)))?;
  remove_dir("put_old")?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mount_targets_stay_under_the_box_root() {
    for entry in MOUNTS {
      assert!(
        !entry.target.starts_with('/'),
        "absolute target '{}' would escape the box",
        entry.target
      );
    }
  }

  #[test]
  fn only_box_and_tmp_are_writable() {
    let writable = MOUNTS
      .iter()
      .filter(|m| m.writable)
      .map(|m| m.target)
      .collect::<Vec<_>>();
    assert_eq!(writable, vec!["box", "tmp"]);
  }

  #[test]
  fn no_bind_mount_allows_devices() {
    assert!(MOUNTS.iter().all(|m| !m.dev));
  }

  #[test]
  fn proc_is_private_and_tmp_is_fresh() {
    let proc = MOUNTS.iter().find(|m| m.target == "proc").unwrap();
    assert_eq!(proc.fstype, Some("proc"));
    assert!(proc.source.is_none());

    let tmp = MOUNTS.iter().find(|m| m.target == "tmp").unwrap();
    assert_eq!(tmp.fstype, Some("tmpfs"));
  }

  #[test]
  fn identity_files_list_only_root_and_nobody() {
    assert_eq!(PASSWD.lines().count(), 2);
    assert!(PASSWD.contains("root:x:0:0"));
    assert!(PASSWD.contains("nobody:x:65534:65534"));
    assert_eq!(GROUP.lines().count(), 2);
    assert!(GROUP.contains("root:x:0"));
    assert!(GROUP.contains("nogroup:x:65534"));
  }
}
