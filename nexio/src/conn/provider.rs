//! Channel providers: thin per-socket transport adapters.
//!
//! A provider performs the raw non-blocking reads and writes for one
//! connection and manipulates the interest ops of its selection key. Stream
//! sockets and client-mode datagram sockets own their socket; server-mode
//! datagram providers share the server's socket and source their reads from
//! a per-peer backlog filled by the datagram demultiplexer.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use socket2::Socket;

use crate::conn::Connection;
use crate::error::NetError;
use crate::selector::key::SelectionKey;
use crate::selector::poller::{OP_CONNECT, OP_READ, OP_WRITE};
use crate::selector::TimerHandle;
use crate::sync::Mutex;

/// Result of one non-blocking read or write.
pub(crate) enum IoStatus {
  /// Bytes transferred.
  Ready(usize),
  /// The kernel refuses more for now.
  WouldBlock,
  /// Peer closed (reads only).
  Closed,
}

pub(crate) fn is_would_block(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
  )
}

pub(crate) trait ChannelProvider: Send + Sync {
  /// Non-blocking connect. Returns `true` if the kernel completed the
  /// connect synchronously; otherwise write-readiness is armed and a
  /// one-shot timeout task is scheduled.
  fn connect(
    &self,
    conn: &Connection,
    remote: SocketAddr,
    timeout_ms: u32,
  ) -> Result<bool, NetError>;

  /// Complete a non-blocking connect after connect-readiness fired.
  fn finish_connect(&self) -> io::Result<()> {
    Ok(())
  }

  fn read(&self, buf: &mut [u8]) -> io::Result<IoStatus>;
  fn write(&self, buf: &[u8]) -> io::Result<IoStatus>;

  /// The connection spilled bytes to its write backlog; arm
  /// write-readiness and wake the selector.
  fn write_backlog_started(&self, conn: &Connection);

  /// The write backlog drained; disarm write-readiness and wake the
  /// selector.
  fn write_backlog_ended(&self, conn: &Connection);

  fn set_read_block(&self, block: bool);

  /// True if the underlying socket is in a useful state.
  fn is_available(&self) -> bool;

  /// Close the socket, serialized with the selection key.
  fn close(&self);
}

/// Provider for TCP stream sockets.
pub(crate) struct StreamProvider {
  fd: RawFd,
  sock: Mutex<Option<Socket>>,
  key: Arc<SelectionKey>,
  connect_timeout: Mutex<Option<TimerHandle>>,
}

impl StreamProvider {
  pub fn new(sock: Socket, key: Arc<SelectionKey>) -> Self {
    Self {
      fd: sock.as_raw_fd(),
      sock: Mutex::new(Some(sock)),
      key,
      connect_timeout: Mutex::new(None),
    }
  }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<IoStatus> {
  match syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())) {
    Ok(0) => Ok(IoStatus::Closed),
    Ok(n) => Ok(IoStatus::Ready(n as usize)),
    Err(err) if is_would_block(&err) => Ok(IoStatus::WouldBlock),
    Err(err) => Err(err),
  }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<IoStatus> {
  match syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())) {
    Ok(n) => Ok(IoStatus::Ready(n as usize)),
    Err(err) if is_would_block(&err) => Ok(IoStatus::WouldBlock),
    Err(err) => Err(err),
  }
}

impl ChannelProvider for StreamProvider {
  fn connect(
    &self,
    conn: &Connection,
    remote: SocketAddr,
    timeout_ms: u32,
  ) -> Result<bool, NetError> {
    let result = {
      let sock = self.sock.lock();
      let Some(sock) = sock.as_ref() else {
        return Err(NetError::Unsupported("socket is closed"));
      };
      sock.connect(&remote.into())
    };
    match result {
      Ok(()) => Ok(true),
      Err(err)
        if err.raw_os_error() == Some(libc::EINPROGRESS)
          || err.kind() == io::ErrorKind::WouldBlock =>
      {
        self.key.set_interest(OP_CONNECT);
        self.key.wake_selector();
        if timeout_ms > 0 {
          if let Some(selector) = self.key.selector() {
            let weak = conn.downgrade();
            let handle = selector.schedule(
              Duration::from_millis(u64::from(timeout_ms)),
              move || {
                if let Some(conn) = weak.upgrade() {
                  if !conn.connect_fired() {
                    conn.handle_timeout();
                    conn.destroy();
                  }
                }
              },
            );
            *self.connect_timeout.lock() = Some(handle);
          }
        }
        Ok(false)
      }
      Err(err) => Err(err.into()),
    }
  }

  fn finish_connect(&self) -> io::Result<()> {
    let sock = self.sock.lock();
    let Some(sock) = sock.as_ref() else {
      return Err(io::ErrorKind::NotConnected.into());
    };
    if let Some(err) = sock.take_error()? {
      return Err(err);
    }
    sock.peer_addr().map(|_| ())
  }

  fn read(&self, buf: &mut [u8]) -> io::Result<IoStatus> {
    read_fd(self.fd, buf)
  }

  fn write(&self, buf: &[u8]) -> io::Result<IoStatus> {
    write_fd(self.fd, buf)
  }

  fn write_backlog_started(&self, _conn: &Connection) {
    self.key.enable_op(OP_WRITE);
    self.key.wake_selector();
  }

  fn write_backlog_ended(&self, _conn: &Connection) {
    self.key.disable_op(OP_WRITE);
    self.key.wake_selector();
  }

  fn set_read_block(&self, block: bool) {
    // while awaiting connect completion the interest set stays untouched
    if self.key.interest() & OP_CONNECT != 0 {
      return;
    }
    if block {
      self.key.disable_op(OP_READ);
    } else {
      self.key.enable_op(OP_READ);
    }
  }

  fn is_available(&self) -> bool {
    self
      .sock
      .lock()
      .as_ref()
      .map(|s| s.peer_addr().is_ok())
      .unwrap_or(false)
  }

  fn close(&self) {
    if let Some(handle) = self.connect_timeout.lock().take() {
      handle.cancel();
    }
    let _guard = self.key.lock();
    self.key.cancel();
    self.sock.lock().take();
  }
}

/// Provider for client-mode datagram sockets, kernel-connected to one
/// remote.
pub(crate) struct DatagramProvider {
  fd: RawFd,
  sock: Mutex<Option<Socket>>,
  key: Arc<SelectionKey>,
}

impl DatagramProvider {
  pub fn new(sock: Socket, key: Arc<SelectionKey>) -> Self {
    Self { fd: sock.as_raw_fd(), sock: Mutex::new(Some(sock)), key }
  }
}

impl ChannelProvider for DatagramProvider {
  fn connect(
    &self,
    _conn: &Connection,
    remote: SocketAddr,
    _timeout_ms: u32,
  ) -> Result<bool, NetError> {
    let sock = self.sock.lock();
    let Some(sock) = sock.as_ref() else {
      return Err(NetError::Unsupported("socket is closed"));
    };
    sock.connect(&remote.into())?;
    Ok(true)
  }

  fn read(&self, buf: &mut [u8]) -> io::Result<IoStatus> {
    match syscall!(recv(
      self.fd,
      buf.as_mut_ptr() as *mut libc::c_void,
      buf.len(),
      0
    )) {
      // a zero-length datagram is data, not EOF
      Ok(n) => Ok(IoStatus::Ready(n as usize)),
      Err(err) if is_would_block(&err) => Ok(IoStatus::WouldBlock),
      Err(err) => Err(err),
    }
  }

  fn write(&self, buf: &[u8]) -> io::Result<IoStatus> {
    match syscall!(send(
      self.fd,
      buf.as_ptr() as *const libc::c_void,
      buf.len(),
      0
    )) {
      Ok(n) => Ok(IoStatus::Ready(n as usize)),
      Err(err) if is_would_block(&err) => Ok(IoStatus::WouldBlock),
      Err(err) => Err(err),
    }
  }

  fn write_backlog_started(&self, _conn: &Connection) {
    self.key.enable_op(OP_WRITE);
    self.key.wake_selector();
  }

  fn write_backlog_ended(&self, _conn: &Connection) {
    self.key.disable_op(OP_WRITE);
    self.key.wake_selector();
  }

  fn set_read_block(&self, block: bool) {
    if block {
      self.key.disable_op(OP_READ);
    } else {
      self.key.enable_op(OP_READ);
    }
  }

  fn is_available(&self) -> bool {
    // datagram sockets can always send and receive
    self.sock.lock().is_some()
  }

  fn close(&self) {
    let _guard = self.key.lock();
    self.key.cancel();
    self.sock.lock().take();
  }
}

/// Server-mode datagram provider: one per synthesized peer connection, all
/// sharing the server's unconnected socket.
pub(crate) struct PeerDatagramProvider {
  sock: Arc<Socket>,
  key: Arc<SelectionKey>,
  remote: SocketAddr,
  read_backlog: Arc<SegQueue<Vec<u8>>>,
  notify_write_backlog: Box<dyn Fn(&Connection) + Send + Sync>,
}

impl PeerDatagramProvider {
  pub fn new(
    sock: Arc<Socket>,
    key: Arc<SelectionKey>,
    remote: SocketAddr,
    read_backlog: Arc<SegQueue<Vec<u8>>>,
    notify_write_backlog: Box<dyn Fn(&Connection) + Send + Sync>,
  ) -> Self {
    Self { sock, key, remote, read_backlog, notify_write_backlog }
  }
}

impl ChannelProvider for PeerDatagramProvider {
  fn connect(
    &self,
    _conn: &Connection,
    _remote: SocketAddr,
    _timeout_ms: u32,
  ) -> Result<bool, NetError> {
    Err(NetError::Unsupported(
      "server-side datagram connections cannot connect",
    ))
  }

  fn read(&self, buf: &mut [u8]) -> io::Result<IoStatus> {
    match self.read_backlog.pop() {
      Some(datagram) => {
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(IoStatus::Ready(n))
      }
      None => Ok(IoStatus::WouldBlock),
    }
  }

  fn write(&self, buf: &[u8]) -> io::Result<IoStatus> {
    match self.sock.send_to(buf, &self.remote.into()) {
      Ok(n) => Ok(IoStatus::Ready(n)),
      Err(err) if is_would_block(&err) => Ok(IoStatus::WouldBlock),
      Err(err) => Err(err),
    }
  }

  fn write_backlog_started(&self, conn: &Connection) {
    (self.notify_write_backlog)(conn);
    self.key.enable_op(OP_WRITE);
    self.key.wake_selector();
  }

  fn write_backlog_ended(&self, _conn: &Connection) {
    // the demultiplexer notices the drained backlog itself and disarms
    // write-readiness once no backlogged connection remains
  }

  fn set_read_block(&self, _block: bool) {
    // other peers share the socket; read-readiness must stay armed
  }

  fn is_available(&self) -> bool {
    true
  }

  fn close(&self) {
    // the socket represents the server socket and must stay open
  }
}
