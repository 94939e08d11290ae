//! kqueue backend with a pipe-based wakeup notifier.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::{wants_read, wants_write, ReadinessPoll, Ready, NOTIFY_TOKEN};

pub(crate) struct OsPoller {
  kq: OwnedFd,
  notify_read: OwnedFd,
  notify_write: OwnedFd,
}

impl OsPoller {
  /// Apply one filter change, tolerating deletes of absent filters.
  fn change(
    &self,
    ident: RawFd,
    filter: i16,
    flags: u16,
    token: u64,
  ) -> io::Result<()> {
    let change = libc::kevent {
      ident: ident as libc::uintptr_t,
      filter,
      flags,
      fflags: 0,
      data: 0,
      udata: token as *mut libc::c_void,
    };
    match syscall!(kevent(
      self.kq.as_raw_fd(),
      &change as *const libc::kevent,
      1,
      ptr::null_mut(),
      0,
      ptr::null(),
    )) {
      Ok(_) => Ok(()),
      Err(err)
        if flags & libc::EV_DELETE != 0
          && err.raw_os_error() == Some(libc::ENOENT) =>
      {
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  fn apply(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    let read_flags = if wants_read(ops) {
      libc::EV_ADD | libc::EV_ENABLE
    } else {
      libc::EV_DELETE
    };
    let write_flags = if wants_write(ops) {
      libc::EV_ADD | libc::EV_ENABLE
    } else {
      libc::EV_DELETE
    };
    self.change(fd, libc::EVFILT_READ, read_flags, token)?;
    self.change(fd, libc::EVFILT_WRITE, write_flags, token)?;
    Ok(())
  }
}

fn make_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
  syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
  Ok(())
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::kevent;

  fn new() -> io::Result<Self> {
    let kq = unsafe {
      let fd = syscall!(kqueue())?;
      OwnedFd::from_raw_fd(fd)
    };

    let mut fds = [0i32; 2];
    syscall!(pipe(fds.as_mut_ptr()))?;
    make_nonblocking_cloexec(fds[0])?;
    make_nonblocking_cloexec(fds[1])?;
    let notify_read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let notify_write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    let poller = Self { kq, notify_read, notify_write };
    poller.change(
      poller.notify_read.as_raw_fd(),
      libc::EVFILT_READ,
      libc::EV_ADD | libc::EV_ENABLE,
      NOTIFY_TOKEN,
    )?;
    Ok(poller)
  }

  fn add(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    self.apply(fd, token, ops)
  }

  fn modify(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    self.apply(fd, token, ops)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0)?;
    self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0)?;
    Ok(())
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let ts;
    let ts_ptr = match timeout {
      Some(d) => {
        ts = libc::timespec {
          tv_sec: d.as_secs() as libc::time_t,
          tv_nsec: d.subsec_nanos() as libc::c_long,
        };
        &ts as *const libc::timespec
      }
      None => ptr::null(),
    };

    match syscall!(kevent(
      self.kq.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as libc::c_int,
      ts_ptr,
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
    event.udata as u64
  }

  fn event_ready(event: &Self::NativeEvent) -> Ready {
    Ready {
      readable: event.filter == libc::EVFILT_READ
        || event.flags & libc::EV_EOF != 0,
      writable: event.filter == libc::EVFILT_WRITE,
    }
  }
}
