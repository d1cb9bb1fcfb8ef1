use std::os::unix::prelude::RawFd;

use nix::{
  errno::Errno,
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::SandboxError;

/// A unidirectional channel across the namespace boundary. Both descriptors
/// are created before `clone(2)`, then each side keeps the end it uses and
/// closes the other. Close-on-exec keeps the write end out of the sandboxed
/// program once `execve` succeeds.
pub struct Pipe(RawFd, RawFd);

pub struct ReadPipe(RawFd);

pub struct WritePipe(RawFd);

/// Upper bound on a single error-channel message.
const MESSAGE_CAPACITY: usize = 1024;

impl Pipe {
  pub fn new() -> Result<Self, SandboxError> {
    let result = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok(Pipe(result.0, result.1))
  }

  /// Keep the read end, close the write end. Borrows so that the tracer and
  /// the cloned supervisor can each split their own copy of the pair.
  pub fn reader(&self) -> Result<ReadPipe, SandboxError> {
    close(self.1)?;
    Ok(ReadPipe(self.0))
  }

  /// Keep the write end, close the read end.
  pub fn writer(&self) -> Result<WritePipe, SandboxError> {
    close(self.0)?;
    Ok(WritePipe(self.1))
  }
}

impl ReadPipe {
  /// Drain the error channel. `None` means the other side reported nothing;
  /// any bytes received are a fatal error message.
  pub fn read_message(&self) -> Result<Option<String>, SandboxError> {
    let mut buf = vec![0 as u8; MESSAGE_CAPACITY];
    match unistd::read(self.0, buf.as_mut_slice()) {
      Ok(0) => Ok(None),
      Ok(size) => {
        let buf = buf
          .into_iter()
          .take(size)
          .take_while(|b| *b != 0)
          .collect::<Vec<u8>>();
        Ok(Some(String::from_utf8_lossy(&buf).to_string()))
      }
      Err(Errno::EAGAIN) => Ok(None),
      Err(errno) => Err(errno.into()),
    }
  }

  /// Read the raw wait-status word relayed by the supervisor.
  pub fn read_status(&self) -> Result<i32, SandboxError> {
    let mut buf = [0 as u8; 4];
    let size = unistd::read(self.0, &mut buf)?;
    if size != buf.len() {
      return Err(SandboxError::exec(
        "status pipe closed before a status was written",
      ));
    }
    Ok(i32::from_ne_bytes(buf))
  }
}

impl Drop for ReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl WritePipe {
  pub fn write_message<S: Into<String>>(&self, text: S) -> Result<usize, SandboxError> {
    let text: String = text.into();
    let mut bytes = text.into_bytes();
    bytes.truncate(MESSAGE_CAPACITY - 1);
    bytes.push(0);
    let size = unistd::write(self.0, &bytes)?;
    Ok(size)
  }

  pub fn write_status(&self, status: i32) -> Result<(), SandboxError> {
    let bytes = status.to_ne_bytes();
    let size = unistd::write(self.0, &bytes)?;
    if size != bytes.len() {
      return Err(SandboxError::exec("short write on status pipe"));
    }
    Ok(())
  }
}

impl Drop for WritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn split(pipe: Pipe) -> (ReadPipe, WritePipe) {
    (ReadPipe(pipe.0), WritePipe(pipe.1))
  }

  #[test]
  fn message_roundtrip() {
    let (rx, tx) = split(Pipe::new().unwrap());
    tx.write_message("mount failed: EPERM").unwrap();
    assert_eq!(
      rx.read_message().unwrap().as_deref(),
      Some("mount failed: EPERM")
    );
  }

  #[test]
  fn oversized_message_is_truncated() {
    let (rx, tx) = split(Pipe::new().unwrap());
    tx.write_message("x".repeat(4 * MESSAGE_CAPACITY)).unwrap();
    let message = rx.read_message().unwrap().unwrap();
    assert_eq!(message.len(), MESSAGE_CAPACITY - 1);
  }

  #[test]
  fn empty_drain_is_none() {
    let (rx, _tx) = split(Pipe::new().unwrap());
    assert!(rx.read_message().unwrap().is_none());
  }

  #[test]
  fn status_roundtrip() {
    let (rx, tx) = split(Pipe::new().unwrap());
    tx.write_status(0x0700).unwrap();
    assert_eq!(rx.read_status().unwrap(), 0x0700);
  }

  #[test]
  fn closed_status_pipe_is_an_error() {
    let rx = Pipe::new().unwrap().reader().unwrap();
    assert!(rx.read_status().is_err());
  }
}
