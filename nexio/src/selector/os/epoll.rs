//! epoll backend with a pipe-based wakeup notifier.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::{wants_read, wants_write, ReadinessPoll, Ready, NOTIFY_TOKEN};

pub(crate) struct OsPoller {
  epoll_fd: OwnedFd,
  /// Read and write ends of the wakeup pipe.
  notify_read: OwnedFd,
  notify_write: OwnedFd,
}

fn event_mask(ops: u8) -> u32 {
  let mut events = 0u32;
  if wants_read(ops) {
    events |= libc::EPOLLIN as u32;
  }
  if wants_write(ops) {
    events |= libc::EPOLLOUT as u32;
  }
  events
}

impl OsPoller {
  fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32, token: u64) -> io::Result<()> {
    let mut event = libc::epoll_event { events: mask, u64: token };
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      op,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::epoll_event;

  fn new() -> io::Result<Self> {
    let epoll_fd = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };

    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    let notify_read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let notify_write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    let poller = Self { epoll_fd, notify_read, notify_write };
    poller.ctl(
      libc::EPOLL_CTL_ADD,
      poller.notify_read.as_raw_fd(),
      libc::EPOLLIN as u32,
      NOTIFY_TOKEN,
    )?;
    Ok(poller)
  }

  fn add(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, event_mask(ops), token)
  }

  fn modify(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, event_mask(ops), token)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      // a closed fd was already dropped from the interest list
      Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
        Err(io::Error::from_raw_os_error(libc::ENOENT))
      }
      Err(err) => Err(err),
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = match timeout {
      Some(d) => {
        let ms = d.as_millis();
        if ms > i32::MAX as u128 {
          i32::MAX
        } else {
          ms as i32
        }
      }
      None => -1,
    };

    match syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    )) {
      Ok(n) => Ok(n as usize),
      Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(0),
      Err(err) => Err(err),
    }
  }

  fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    match syscall!(write(
      self.notify_write.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    )) {
      // a full pipe already guarantees a pending wakeup
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  fn drain_notify(&self) {
    let mut buf = [0u8; 64];
    loop {
      match syscall!(read(
        self.notify_read.as_raw_fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
      )) {
        Ok(n) if n as usize == buf.len() => continue,
        _ => break,
      }
    }
  }

  fn event_token(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_ready(event: &Self::NativeEvent) -> Ready {
    let bits = event.events;
    let err = bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
    Ready {
      // error/hangup conditions are surfaced as readiness on both sides so
      // the next syscall reports the failure to the handler
      readable: bits & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32) != 0
        || err,
      writable: bits & libc::EPOLLOUT as u32 != 0 || err,
    }
  }
}
