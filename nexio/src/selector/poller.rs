//! Readiness polling over the platform primitive.
//!
//! Uses epoll on Linux and kqueue on the BSDs/macOS. Registrations are
//! level-triggered: a selection key's interest set persists until it is
//! changed, which matches how interest ops drive the connection state
//! machine (read interest stays armed, write interest is armed only while a
//! write backlog exists or a connect is pending).

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
#[path = "os/epoll.rs"]
mod sys;

#[cfg(any(
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd",
  target_os = "dragonfly",
  target_os = "openbsd",
  target_os = "netbsd"
))]
#[path = "os/kqueue.rs"]
mod sys;

/// Interest op: readable.
pub(crate) const OP_READ: u8 = 1 << 0;
/// Interest op: writable.
pub(crate) const OP_WRITE: u8 = 1 << 2;
/// Interest op: awaiting completion of a non-blocking connect. Maps to
/// write-readiness at the OS level but is kept distinct so key handlers can
/// tell a finished connect apart from a flushable backlog.
pub(crate) const OP_CONNECT: u8 = 1 << 3;

/// Token reserved for the wakeup notifier.
pub(crate) const NOTIFY_TOKEN: u64 = u64::MAX;

fn wants_read(ops: u8) -> bool {
  ops & OP_READ != 0
}

fn wants_write(ops: u8) -> bool {
  ops & (OP_WRITE | OP_CONNECT) != 0
}

/// Readiness reported for one selection key.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Ready {
  pub readable: bool,
  pub writable: bool,
}

/// One OS-specific readiness backend.
pub(crate) trait ReadinessPoll {
  type NativeEvent: Copy;

  fn new() -> io::Result<Self>
  where
    Self: Sized;

  /// Register a file descriptor. `ops` may be empty; interest is added
  /// later via [`modify`](Self::modify).
  fn add(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()>;

  /// Replace the interest set of a registered file descriptor.
  fn modify(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()>;

  /// Remove a file descriptor entirely.
  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Block until readiness or timeout. Returns the number of raw events.
  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize>;

  /// Force a blocking [`wait`](Self::wait) to return.
  fn notify(&self) -> io::Result<()>;

  /// Consume pending notifications so the next wait can block again.
  fn drain_notify(&self);

  fn event_token(event: &Self::NativeEvent) -> u64;
  fn event_ready(event: &Self::NativeEvent) -> Ready;
}

/// Platform poller plus the reusable event buffer bookkeeping.
pub(crate) struct Poller {
  inner: sys::OsPoller,
}

impl Poller {
  pub fn new() -> io::Result<Self> {
    Ok(Self { inner: sys::OsPoller::new()? })
  }

  pub fn add(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    self.inner.add(fd, token, ops)
  }

  pub fn modify(&self, fd: RawFd, token: u64, ops: u8) -> io::Result<()> {
    self.inner.modify(fd, token, ops)
  }

  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    self.inner.delete(fd)
  }

  pub fn notify(&self) -> io::Result<()> {
    self.inner.notify()
  }

  /// Wait for readiness, filling `events`. Notifier events are drained here
  /// and skipped by [`Events::iter`].
  pub fn wait(
    &self,
    events: &mut Events,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    events.len = 0;
    let n = self.inner.wait(&mut events.buf, timeout)?;
    events.len = n;
    for i in 0..n {
      if sys::OsPoller::event_token(&events.buf[i]) == NOTIFY_TOKEN {
        self.inner.drain_notify();
      }
    }
    Ok(())
  }
}

/// Reusable buffer of raw readiness events.
pub(crate) struct Events {
  buf: Vec<<sys::OsPoller as ReadinessPoll>::NativeEvent>,
  len: usize,
}

impl Events {
  pub fn with_capacity(capacity: usize) -> Self {
    // zeroed native events; the OS overwrites the first `len` on each wait
    Self { buf: vec![unsafe { std::mem::zeroed() }; capacity], len: 0 }
  }

  /// Iterate (token, readiness) pairs, skipping the internal notifier.
  pub fn iter(&self) -> impl Iterator<Item = (u64, Ready)> + '_ {
    self.buf[..self.len]
      .iter()
      .map(|ev| {
        (sys::OsPoller::event_token(ev), sys::OsPoller::event_ready(ev))
      })
      .filter(|(token, _)| *token != NOTIFY_TOKEN)
  }
}
