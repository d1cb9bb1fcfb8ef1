use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::prelude::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::{fchmod, Mode};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
  chdir, close, dup2, execve, fork, setgroups, sethostname, setresgid, setresuid, ForkResult,
  Gid, Pid, Uid,
};

use crate::cgroup::SandboxCgroup;
use crate::context::{ResourceLimits, Sandbox, SandboxResult};
use crate::error::SandboxError;
use crate::pipe::{Pipe, ReadPipe, WritePipe};
use crate::rootfs;
use crate::utils::into_c_string;

/// Timeout polling period.
const TRACE_PERIOD_US: libc::suseconds_t = 10_000;

/// The unprivileged identity the program runs as; matches the `nobody` entry
/// written into the box's /etc/passwd.
const NOBODY: u32 = 65534;

const HOSTNAME: &str = "sandj";

const STACK_SIZE: usize = 1024 * 1024;

static CHECK_TIMEOUT: AtomicBool = AtomicBool::new(false);

extern "C" fn trace_tick(_signal: libc::c_int) {
  // Flag only; the limit comparison happens back in the polling loop.
  CHECK_TIMEOUT.store(true, Ordering::Relaxed);
}

/// Execute one command inside the sandbox. The calling process becomes the
/// tracer; the cloned child enters the fresh namespace set as the supervisor
/// and forks the actual program process.
pub(crate) fn run(
  sandbox: &Sandbox,
  limits: &ResourceLimits,
  command: &[String],
) -> Result<SandboxResult, SandboxError> {
  let cgroup = SandboxCgroup::load(sandbox.name())?;
  cgroup.apply_limits(limits)?;
  cgroup.reset_cpu_usage()?;

  // Both pipes must exist before the namespace boundary is crossed so each
  // side can keep the end it needs.
  let status_pipe = Pipe::new()?;
  let error_pipe = Pipe::new()?;

  let mut stack = vec![0 as u8; STACK_SIZE];
  let flags = CloneFlags::CLONE_NEWIPC
    | CloneFlags::CLONE_NEWNET
    | CloneFlags::CLONE_NEWNS
    | CloneFlags::CLONE_NEWPID
    | CloneFlags::CLONE_NEWUTS;

  let box_pid = clone(
    Box::new(|| supervise(sandbox, limits, command, &status_pipe, &error_pipe)),
    stack.as_mut_slice(),
    flags,
    Some(libc::SIGCHLD),
  )
  .map_err(|errno| SandboxError::fork(format!("clone into new namespaces failed: {}", errno)))?;

  info!("Supervisor started (pid = {})", box_pid);

  let status_rx = status_pipe.reader()?;
  let error_rx = error_pipe.reader()?;

  trace(box_pid, &cgroup, limits, &status_rx, &error_rx)
}

/// Supervise the run to completion: poll the limits on a fixed period, tear
/// the process tree down unconditionally, then assemble the result record.
fn trace(
  box_pid: Pid,
  cgroup: &SandboxCgroup,
  limits: &ResourceLimits,
  status_rx: &ReadPipe,
  error_rx: &ReadPipe,
) -> Result<SandboxResult, SandboxError> {
  CHECK_TIMEOUT.store(false, Ordering::Relaxed);
  arm_trace_timer()?;
  let started = Instant::now();

  let polled = poll(box_pid, cgroup, limits, &started);
  disarm_trace_timer();

  // Failures on the far side of the namespace boundary cannot reach a
  // terminal; the error channel is their only way out.
  let failure = error_rx.read_message();

  // The program may have exited, timed out or failed. Either way the tree is
  // torn down.
  kill_box(box_pid);

  let timeout = polled?;
  if let Some(message) = failure? {
    return Err(SandboxError::exec(message));
  }

  let (exitcode, signal) = if timeout {
    (None, None)
  } else {
    classify(status_rx.read_status()?)?
  };

  Ok(SandboxResult {
    cpu_time_ns: cgroup.cpu_time_ns()?,
    real_time_ns: started.elapsed().as_nanos() as u64,
    memory_kb: cgroup.peak_memory_kb()?,
    timeout,
    oom_kill: cgroup.oom_killed()?,
    exitcode,
    signal,
  })
}

/// Block on the supervisor, waking on every timer tick to compare the
/// configured limits. Returns true iff a limit was exceeded.
fn poll(
  box_pid: Pid,
  cgroup: &SandboxCgroup,
  limits: &ResourceLimits,
  started: &Instant,
) -> Result<bool, SandboxError> {
  loop {
    if CHECK_TIMEOUT.swap(false, Ordering::Relaxed) {
      if let Some(limit) = limits.cpu_time_limit_ns {
        if cgroup.cpu_time_ns()? > limit {
          info!("CPU time limit exceeded");
          return Ok(true);
        }
      }
      if let Some(limit) = limits.real_time_limit_ns {
        if started.elapsed().as_nanos() as u64 > limit {
          info!("Real time limit exceeded");
          return Ok(true);
        }
      }
    }

    match waitpid(box_pid, None) {
      Ok(status) => {
        debug!("Supervisor finished: {:?}", status);
        return Ok(false);
      }
      // The interval timer interrupts the wait on every tick.
      Err(Errno::EINTR) => continue,
      Err(errno) => {
        return Err(SandboxError::fork(format!(
          "waitpid on supervisor failed: {}",
          errno
        )))
      }
    }
  }
}

fn arm_trace_timer() -> Result<(), SandboxError> {
  let action = SigAction::new(
    SigHandler::Handler(trace_tick),
    SaFlags::empty(),
    SigSet::empty(),
  );
  unsafe { sigaction(Signal::SIGALRM, &action) }?;

  let period = libc::timeval {
    tv_sec: 0,
    tv_usec: TRACE_PERIOD_US,
  };
  let timer = libc::itimerval {
    it_interval: period,
    it_value: period,
  };
  if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) } == -1 {
    return Err(Errno::last().into());
  }
  Ok(())
}

fn disarm_trace_timer() {
  let period = libc::timeval {
    tv_sec: 0,
    tv_usec: 0,
  };
  let timer = libc::itimerval {
    it_interval: period,
    it_value: period,
  };
  unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
}

/// Best-effort sweep of the supervisor's process group first, then the kill
/// that matters: the supervisor is pid 1 of the new pid namespace, and
/// killing it reclaims every process inside. The final reap clears the
/// zombie so the cgroup empties promptly.
fn kill_box(box_pid: Pid) {
  let _ = kill(Pid::from_raw(-box_pid.as_raw()), Signal::SIGKILL);
  let _ = kill(box_pid, Signal::SIGKILL);
  let _ = waitpid(box_pid, None);
}

/// Split the raw wait-status word into an exit code or a signal. Any other
/// shape is an internal error.
fn classify(raw_status: i32) -> Result<(Option<i32>, Option<Signal>), SandboxError> {
  match WaitStatus::from_raw(Pid::from_raw(0), raw_status) {
    Ok(WaitStatus::Exited(_, code)) => Ok((Some(code), None)),
    Ok(WaitStatus::Signaled(_, signal, _)) => Ok((None, Some(signal))),
    Ok(WaitStatus::Stopped(_, signal)) => Ok((None, Some(signal))),
    Ok(status) => Err(SandboxError::exec(format!(
      "sandbox received bad status {:?}",
      status
    ))),
    Err(errno) => Err(SandboxError::exec(format!(
      "sandbox received bad status {:#x}: {}",
      raw_status, errno
    ))),
  }
}

/// Body of the namespace-init process. Keeps only the pipes' write ends,
/// forks the program process, relays its raw wait status and exits.
fn supervise(
  sandbox: &Sandbox,
  limits: &ResourceLimits,
  command: &[String],
  status_pipe: &Pipe,
  error_pipe: &Pipe,
) -> isize {
  let error_tx = match error_pipe.writer() {
    Ok(tx) => tx,
    // Nothing left to report through.
    Err(_) => unsafe { libc::_exit(2) },
  };
  let status_tx = match status_pipe.writer() {
    Ok(tx) => tx,
    Err(err) => fail(&error_tx, &err),
  };

  match unsafe { fork() } {
    Ok(ForkResult::Child) => {
      let err = run_program(sandbox, limits, command);
      fail(&error_tx, &err)
    }
    Ok(ForkResult::Parent { child, .. }) => {
      debug!("Program process started (pid = {})", child);

      let mut status: libc::c_int = 0;
      if unsafe { libc::waitpid(child.as_raw(), &mut status, 0) } == -1 {
        fail(&error_tx, &SandboxError::from(Errno::last()));
      }
      if let Err(err) = status_tx.write_status(status) {
        fail(&error_tx, &err);
      }
      unsafe { libc::_exit(0) }
    }
    Err(errno) => fail(
      &error_tx,
      &SandboxError::fork(format!("fork of program process failed: {}", errno)),
    ),
  }
}

fn fail(error_tx: &WritePipe, err: &SandboxError) -> ! {
  let _ = error_tx.write_message(format!("{}", err));
  unsafe { libc::_exit(2) }
}

/// Setup chain of the program process. Only ever returns an error; on
/// success `execve` replaces the process image.
fn run_program(sandbox: &Sandbox, limits: &ResourceLimits, command: &[String]) -> SandboxError {
  match program_setup(sandbox, limits, command) {
    Ok(never) => match never {},
    Err(err) => err,
  }
}

fn program_setup(
  sandbox: &Sandbox,
  limits: &ResourceLimits,
  command: &[String],
) -> Result<Infallible, SandboxError> {
  // Attach before the root pivot hides /sys; from here on every byte and
  // every tick is accounted against the sandbox.
  let cgroup = SandboxCgroup::load(sandbox.name())?;
  cgroup.attach_current()?;

  rootfs::build(&sandbox.box_path())?;

  rlim_setup(limits)?;
  uts_setup()?;
  io_setup()?;
  user_setup()?;

  chdir("home")?;

  let program = into_c_string(&command[0]);
  let args = command.iter().map(into_c_string).collect::<Vec<CString>>();
  let env = [into_c_string("PATH=/bin:/usr/bin")];

  info!("Executing {}", command.join(" "));

  execve(program.as_c_str(), &args, &env).map_err(|errno| {
    SandboxError::exec(format!("execve('{}') failed: {}", command[0], errno.desc()))
  })
}

fn rlim_setup(limits: &ResourceLimits) -> Result<(), SandboxError> {
  if let Some(fsize_kb) = limits.max_fsize_kb {
    let bytes = fsize_kb << 10;
    setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
  }
  Ok(())
}

fn uts_setup() -> Result<(), SandboxError> {
  sethostname(HOSTNAME)?;
  Ok(())
}

/// Redirect the standard streams into the run directory: `home/in` feeds
/// stdin when present, `home/out` and `home/err` capture the output.
fn io_setup() -> Result<(), SandboxError> {
  if Path::new("home/in").exists() {
    redirect("home/in", libc::STDIN_FILENO, OFlag::O_RDONLY, 0o644)?;
  }
  let out_flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;
  redirect("home/out", libc::STDOUT_FILENO, out_flags, 0o622)?;
  redirect("home/err", libc::STDERR_FILENO, out_flags, 0o622)?;
  Ok(())
}

fn redirect(path: &str, stdio_fd: RawFd, oflag: OFlag, mode: u32) -> Result<(), SandboxError> {
  let mode = Mode::from_bits_truncate(mode);
  let fd = open(path, oflag, mode)
    .map_err(|errno| SandboxError::fs(format!("failed to open '{}': {}", path, errno)))?;
  fchmod(fd, mode)?;
  dup2(fd, stdio_fd)?;
  close(fd)?;
  Ok(())
}

/// Drop to the unprivileged identity. Group first: once the user id is gone
/// the group ids can no longer be changed.
fn user_setup() -> Result<(), SandboxError> {
  let gid = Gid::from_raw(NOBODY);
  let uid = Uid::from_raw(NOBODY);
  setresgid(gid, gid, gid)?;
  setgroups(&[])?;
  setresuid(uid, uid, uid)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normal_exit_yields_the_exit_code() {
    assert!(matches!(classify(7 << 8), Ok((Some(7), None))));
    assert!(matches!(classify(0), Ok((Some(0), None))));
    assert!(matches!(classify(255 << 8), Ok((Some(255), None))));
  }

  #[test]
  fn termination_by_signal_yields_the_signal() {
    assert!(matches!(classify(9), Ok((None, Some(Signal::SIGKILL)))));
    assert!(matches!(classify(11), Ok((None, Some(Signal::SIGSEGV)))));
  }

  #[test]
  fn stopped_process_yields_the_stop_signal() {
    let raw = 0x7f | ((Signal::SIGSTOP as i32) << 8);
    assert!(matches!(classify(raw), Ok((None, Some(Signal::SIGSTOP)))));
  }

  #[test]
  fn garbage_status_is_an_error() {
    assert!(classify(0xffff).is_err());
  }
}
