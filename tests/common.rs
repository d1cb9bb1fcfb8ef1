use std::path::Path;
use std::sync::{Mutex, MutexGuard, Once};

use flexi_logger::Logger;
use nix::unistd::Uid;

static INIT: Once = Once::new();

static SERIAL: Mutex<()> = Mutex::new(());

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("sandj=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// Exercising the kernel side needs root plus the three v1 controllers, with
/// swap accounting enabled for the memsw peak reads.
pub fn sandbox_available() -> bool {
  Uid::effective().is_root()
    && Path::new("/sys/fs/cgroup/cpuacct").is_dir()
    && Path::new("/sys/fs/cgroup/pids").is_dir()
    && Path::new("/sys/fs/cgroup/memory/memory.memsw.max_usage_in_bytes").exists()
}

/// The tracer's timer signal and wait loop are process-wide; kernel tests
/// must not overlap.
pub fn serial() -> MutexGuard<'static, ()> {
  SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
