use std::ffi::CString;
use std::fs;
use std::path::Path;

use flexi_logger::DeferredNow;
use log::Record;
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

use crate::error::SandboxError;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Sandbox 'main' was initialized```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> CString {
  let string = string.as_ref();
  CString::new(string).expect("Convert &str to CString should work")
}

/// Single-shot formatted file write (create or truncate).
pub(crate) fn write_file<P: AsRef<Path>>(path: P, content: &str) -> Result<(), SandboxError> {
  fs::write(path, content)?;
  Ok(())
}

/// Change ownership of the whole tree, depth-first, without following
/// symlinks. A previous run may have left root-owned files behind; they must
/// not block cleanup or the next run.
pub(crate) fn chown_recursive(path: &Path, uid: Uid, gid: Gid) -> Result<(), SandboxError> {
  let metadata = fs::symlink_metadata(path)?;
  if metadata.is_dir() {
    for entry in fs::read_dir(path)? {
      chown_recursive(&entry?.path(), uid, gid)?;
    }
  }
  fchownat(
    None,
    path,
    Some(uid),
    Some(gid),
    FchownatFlags::NoFollowSymlink,
  )?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_file_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passwd");
    write_file(&path, "root:x:0:0:root:\n").unwrap();
    write_file(&path, "nobody:x:65534:65534:nobody:\n").unwrap();
    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content, "nobody:x:65534:65534:nobody:\n");
  }

  #[test]
  fn chown_to_self_walks_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("home/deep")).unwrap();
    fs::write(dir.path().join("home/deep/out"), "x").unwrap();
    // Chown to the current owner is a no-op the walk must still survive.
    chown_recursive(dir.path(), Uid::current(), Gid::current()).unwrap();
  }
}
