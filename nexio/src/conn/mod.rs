//! Connections: ordered bidirectional byte streams with lifecycle events.
//!
//! The base machinery here owns the write backlog (bytes the kernel refused),
//! the pre-connect write queue (bytes written before the transport
//! connected) and event dispatch. Transports ([`plain`], [`tls`], [`dtls`])
//! layer the byte-level protocol on top, with the provider as the physical
//! sink.

pub(crate) mod buffer;
pub(crate) mod dtls;
pub(crate) mod plain;
pub(crate) mod provider;
pub(crate) mod tls;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;

use crate::config;
use crate::error::NetError;
use crate::event::{
  sync_worker, DataHandler, ErrorHandler, Event, EventTable, Handler, Task,
  Worker,
};
use crate::selector::key::SelectionKey;
use crate::sync::Mutex;

use provider::{ChannelProvider, IoStatus};

/// Default read/write buffer size for plaintext connections.
pub(crate) const PLAIN_BUF_SIZE: usize = 8192;

pub(crate) type LocalHook = Box<dyn Fn(&Connection) + Send + Sync>;

/// Outcome of a transport read, settled after all transport locks are
/// released so that close/error dispatch never runs under them.
pub(crate) enum ReadOutcome {
  None,
  Data(Vec<u8>),
  /// Handshake finished; payload may already have been decrypted.
  Connected(Option<Vec<u8>>),
  /// Transport EOF: forced close.
  Eof,
}

/// Byte-level protocol behavior layered over the base connection.
pub(crate) trait Transport: Send + Sync {
  /// Non-blocking read; `None` when no application payload materialized.
  fn read(&self, conn: &Connection) -> Option<Vec<u8>>;

  /// Buffered write. `flush` pushes to the kernel; `force` bypasses the
  /// pre-connect queue (used while draining it).
  fn write_buffered(
    &self,
    conn: &Connection,
    data: &[u8],
    flush: bool,
    force: bool,
  );

  /// Drain staged bytes and the write backlog; `true` iff everything was
  /// written.
  fn flush(&self, conn: &Connection) -> bool;

  /// The transport-level connect completed (client) or the connection was
  /// accepted/synthesized (server).
  fn on_socket_connect(&self, conn: &Connection);

  /// Orderly protocol shutdown before the provider closes.
  fn before_close(&self, _conn: &Connection) {}

  fn is_connected(&self, conn: &Connection) -> bool;

  fn tls(&self) -> Option<&dyn TlsAccess> {
    None
  }
}

/// Accessors of TLS/DTLS connections.
pub trait TlsAccess {
  /// Negotiated protocol name, e.g. `TLSv1.3`.
  fn protocol(&self) -> Option<String>;
  /// Negotiated cipher suite name.
  fn cipher(&self) -> Option<String>;
  /// Negotiated ALPN protocol; empty is normalized to `None`.
  fn application_protocol(&self) -> Option<String>;
}

pub(crate) struct WriteState {
  /// Pre-connect write queue; `Some` exactly until the `connect` event is
  /// dispatched.
  queue: Option<Vec<Vec<u8>>>,
  /// Staging buffer for the next provider write.
  pub staging: Vec<u8>,
  pub staging_cap: usize,
  /// FIFO of byte chunks the kernel refused.
  backlog: VecDeque<Vec<u8>>,
  /// Partially drained chunk, popped from the backlog.
  backlog_staging: Vec<u8>,
  backlog_pos: usize,
  pending_close: bool,
}

impl WriteState {
  fn new(staging_cap: usize) -> Self {
    Self {
      queue: Some(Vec::new()),
      staging: Vec::new(),
      staging_cap,
      backlog: VecDeque::new(),
      backlog_staging: Vec::new(),
      backlog_pos: 0,
      pending_close: false,
    }
  }

  pub fn backlog_empty(&self) -> bool {
    self.backlog.is_empty() && self.backlog_pos >= self.backlog_staging.len()
  }
}

pub(crate) struct Conn {
  provider: Box<dyn ChannelProvider>,
  key: Arc<SelectionKey>,
  io: Box<dyn Transport>,
  remote: Option<SocketAddr>,
  local: Option<SocketAddr>,
  apparent_remote: Mutex<Option<SocketAddr>>,
  last_io: AtomicU64,
  worker: Mutex<Worker>,
  events: Mutex<EventTable>,
  attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
  on_local_connect: Mutex<Option<LocalHook>>,
  on_local_close: Mutex<Option<LocalHook>>,
  connect_fired: AtomicBool,
  closed: AtomicBool,
  local_close: AtomicBool,
  write: Mutex<WriteState>,
}

/// Cloneable handle to a connection.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<Conn>,
}

#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<Conn>);

impl WeakConnection {
  pub fn upgrade(&self) -> Option<Connection> {
    self.0.upgrade().map(|inner| Connection { inner })
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("remote", &self.apparent_remote_address())
      .field("connected", &self.is_connected())
      .finish()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

struct DestroyOnDrop(Connection);

impl Drop for DestroyOnDrop {
  fn drop(&mut self) {
    self.0.destroy();
  }
}

impl Connection {
  pub(crate) fn create(
    key: Arc<SelectionKey>,
    provider: Box<dyn ChannelProvider>,
    io: Box<dyn Transport>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
  ) -> Connection {
    Connection {
      inner: Arc::new(Conn {
        provider,
        key,
        io,
        remote,
        local,
        apparent_remote: Mutex::new(None),
        last_io: AtomicU64::new(config::now_millis()),
        worker: Mutex::new(sync_worker()),
        events: Mutex::new(EventTable::default()),
        attachment: Mutex::new(None),
        on_local_connect: Mutex::new(None),
        on_local_close: Mutex::new(None),
        connect_fired: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        local_close: AtomicBool::new(false),
        write: Mutex::new(WriteState::new(PLAIN_BUF_SIZE)),
      }),
    }
  }

  pub(crate) fn downgrade(&self) -> WeakConnection {
    WeakConnection(Arc::downgrade(&self.inner))
  }

  /// Stable identity of this connection, independent of handle clones.
  pub(crate) fn id(&self) -> usize {
    Arc::as_ptr(&self.inner) as usize
  }

  pub(crate) fn key(&self) -> &Arc<SelectionKey> {
    &self.inner.key
  }

  // ----- addresses, timestamps, attachment -----

  pub fn remote_address(&self) -> Option<SocketAddr> {
    self.inner.remote
  }

  pub fn local_address(&self) -> Option<SocketAddr> {
    self.inner.local
  }

  /// Advisory remote address override for proxied peers.
  pub fn set_apparent_remote_address(&self, addr: Option<SocketAddr>) {
    *self.inner.apparent_remote.lock() = addr;
  }

  pub fn apparent_remote_address(&self) -> Option<SocketAddr> {
    self.inner.apparent_remote.lock().or(self.inner.remote)
  }

  /// Milliseconds (monotonic-sourced) of the last read or write.
  pub fn last_io_time(&self) -> u64 {
    self.inner.last_io.load(Ordering::Relaxed)
  }

  pub(crate) fn touch_io(&self) {
    self.inner.last_io.store(config::now_millis(), Ordering::Relaxed);
  }

  pub fn set_attachment(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
    *self.inner.attachment.lock() = value;
  }

  pub fn attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
    self.inner.attachment.lock().clone()
  }

  // ----- state queries -----

  /// True once the transport is connected and, for encrypted connections,
  /// the handshake completed.
  pub fn is_connected(&self) -> bool {
    self.inner.io.is_connected(self)
  }

  /// True if the underlying socket is connected, regardless of any
  /// handshake state.
  pub fn is_socket_connected(&self) -> bool {
    self.inner.provider.is_available()
  }

  /// True once the `connect` event was dispatched and the pre-connect
  /// write queue was drained.
  pub fn has_connected(&self) -> bool {
    self.inner.write.lock().queue.is_none()
  }

  /// True iff connected and the write backlog is empty.
  pub fn is_writable(&self) -> bool {
    self.is_connected() && self.inner.write.lock().backlog_empty()
  }

  pub(crate) fn connect_fired(&self) -> bool {
    self.inner.connect_fired.load(Ordering::Acquire)
  }

  // ----- event handler registration -----

  pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
    self.inner.events.lock().connect = Some(Arc::new(f) as Handler);
  }

  pub fn on_timeout(&self, f: impl Fn() + Send + Sync + 'static) {
    self.inner.events.lock().timeout = Some(Arc::new(f) as Handler);
  }

  pub fn on_data(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
    self.inner.events.lock().data = Some(Arc::new(f) as DataHandler);
  }

  pub fn on_writable(&self, f: impl Fn() + Send + Sync + 'static) {
    self.inner.events.lock().writable = Some(Arc::new(f) as Handler);
  }

  pub fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
    self.inner.events.lock().close = Some(Arc::new(f) as Handler);
  }

  pub fn on_error(&self, f: impl Fn(&NetError) + Send + Sync + 'static) {
    self.inner.events.lock().error = Some(Arc::new(f) as ErrorHandler);
  }

  /// Remove the handler registered for `event`.
  pub fn clear_handler(&self, event: Event) {
    let mut events = self.inner.events.lock();
    match event {
      Event::Connect => events.connect = None,
      Event::Timeout => events.timeout = None,
      Event::Data => events.data = None,
      Event::Writable => events.writable = None,
      Event::Close => events.close = None,
      Event::Error => events.error = None,
    }
  }

  pub(crate) fn set_default_error_handler(&self, handler: ErrorHandler) {
    self.inner.events.lock().error_default = Some(handler);
  }

  /// Set the worker used to run all events except `error`.
  pub fn set_worker(&self, worker: Worker) {
    *self.inner.worker.lock() = worker;
  }

  pub fn worker(&self) -> Worker {
    self.inner.worker.lock().clone()
  }

  /// TLS accessors, present on encrypted connections.
  pub fn tls(&self) -> Option<&dyn TlsAccess> {
    self.inner.io.tls()
  }

  // ----- management hooks -----

  pub(crate) fn set_on_local_close(&self, hook: LocalHook) {
    let mut slot = self.inner.on_local_close.lock();
    assert!(slot.is_none(), "on_local_close is already set");
    *slot = Some(hook);
  }

  pub(crate) fn set_on_local_connect(&self, hook: LocalHook) {
    let mut slot = self.inner.on_local_connect.lock();
    assert!(slot.is_none(), "on_local_connect is already set");
    *slot = Some(hook);
  }

  pub(crate) fn local_connect(&self) {
    let hook = self.inner.on_local_connect.lock();
    match &*hook {
      Some(hook) => hook(self),
      None => {
        drop(hook);
        self.handle_connect();
      }
    }
  }

  pub(crate) fn local_close(&self) {
    let hook = self.inner.on_local_close.lock();
    match &*hook {
      Some(hook) => hook(self),
      None => {
        drop(hook);
        self.handle_close();
      }
    }
  }

  /// Called by client managers after connect-readiness fired.
  pub(crate) fn finish_transport_connect(&self) -> std::io::Result<()> {
    self.inner.provider.finish_connect()
  }

  /// Run the transport's connect hook (plaintext dispatches `connect`,
  /// encrypted transports begin their handshake).
  pub(crate) fn transport_connected(&self) {
    self.inner.io.on_socket_connect(self);
  }

  // ----- public operations -----

  /// Begin a non-blocking connect to the configured remote address.
  ///
  /// `timeout_ms` of 0 disables the connect timeout. Failures are routed
  /// through the `error` event.
  pub fn connect(&self, timeout_ms: u32) {
    let Some(remote) = self.inner.remote else {
      self.handle_error(NetError::Unsupported(
        "cannot connect because no remote address was specified",
      ));
      return;
    };
    match self.inner.provider.connect(self, remote, timeout_ms) {
      Ok(true) => self.local_connect(),
      Ok(false) => {}
      Err(err) => self.handle_error(err),
    }
  }

  /// Non-blocking read. `None` is the normal case when no application
  /// payload was produced (partial record, would-block, handshake step).
  pub fn read(&self) -> Option<Vec<u8>> {
    self.inner.io.read(self)
  }

  /// Write bytes, flushing to the kernel. Bytes written before the
  /// `connect` event are queued and flushed on connect.
  pub fn write(&self, data: &[u8]) {
    self.inner.io.write_buffered(self, data, true, false);
  }

  /// Write bytes without flushing; defers until the next `write`, `flush`
  /// or write-readiness event.
  pub fn write_queue(&self, data: &[u8]) {
    self.inner.io.write_buffered(self, data, false, false);
  }

  /// Drain staged bytes and the write backlog. Returns `true` iff
  /// everything was written.
  pub fn flush(&self) -> bool {
    self.inner.io.flush(self)
  }

  /// Graceful close: waits for pending bytes to drain, then destroys.
  pub fn close(&self) {
    if !self.inner.local_close.load(Ordering::Acquire) && !self.flush() {
      // data still pending; the backlog-drain path will finish the close
      self.inner.write.lock().pending_close = true;
    } else {
      self.close_internal();
    }
  }

  /// Forced close: discards pending bytes. Idempotent.
  pub fn destroy(&self) {
    self.close_internal();
  }

  fn close_internal(&self) {
    if self.inner.local_close.swap(true, Ordering::AcqRel) {
      return;
    }
    self.inner.io.before_close(self);
    self.local_close();
    self.inner.provider.close();
  }

  /// Best-effort read-blocking; the loop may still deliver in-flight data.
  pub fn set_read_block(&self, block: bool) {
    self.inner.provider.set_read_block(block);
  }

  // ----- event dispatch -----

  fn run_async(&self, f: impl FnOnce() + Send + 'static) {
    let conn = self.clone();
    let task: Task = Box::new(move || {
      if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        conn.handle_error(NetError::HandlerPanic(panic_message(&*payload)));
      }
    });
    let worker = self.worker();
    worker(task);
  }

  /// Dispatch the `connect` event (and drain the pre-connect queue) via
  /// the worker.
  pub(crate) fn handle_connect(&self) {
    self.inner.connect_fired.store(true, Ordering::Release);
    let conn = self.clone();
    self.run_async(move || {
      conn.flush_write_queue();
      let handler = conn.inner.events.lock().connect.clone();
      if let Some(handler) = handler {
        handler();
      }
    });
  }

  /// Dispatch the `timeout` event via the worker; with no handler set the
  /// failure surfaces as an `error`. The connection is destroyed either
  /// way.
  pub(crate) fn handle_timeout(&self) {
    let conn = self.clone();
    self.run_async(move || {
      let _destroy = DestroyOnDrop(conn.clone());
      let (timeout, error) = {
        let events = conn.inner.events.lock();
        (events.timeout.clone(), events.error_handler())
      };
      match timeout {
        Some(handler) => handler(),
        None => {
          if let Some(handler) = error {
            handler(&NetError::ConnectTimedOut);
          }
        }
      }
    });
  }

  /// Dispatch the `data` event via the worker. Returns `false` if no
  /// `data` handler was registered upon entry.
  pub(crate) fn handle_data(&self, data: Vec<u8>) -> bool {
    let had_handler = self.inner.events.lock().data.is_some();
    let conn = self.clone();
    self.run_async(move || {
      let handler = conn.inner.events.lock().data.clone();
      if let Some(handler) = handler {
        handler(&data);
      }
    });
    had_handler
  }

  /// Dispatch the `writable` event via the worker; suppressed until the
  /// `connect` event has fired.
  pub(crate) fn handle_writable(&self) {
    let conn = self.clone();
    self.run_async(move || {
      if !conn.has_connected() {
        return;
      }
      let handler = conn.inner.events.lock().writable.clone();
      if let Some(handler) = handler {
        handler();
      }
    });
  }

  /// Dispatch the `close` event via the worker, exactly once.
  pub(crate) fn handle_close(&self) {
    if self.inner.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let conn = self.clone();
    self.run_async(move || {
      let handler = conn.inner.events.lock().close.clone();
      if let Some(handler) = handler {
        handler();
      }
    });
  }

  /// Dispatch the `error` event synchronously on the calling thread and
  /// forcibly destroy the connection. With no handler registered the error
  /// propagates as a panic on the calling (I/O) thread.
  pub(crate) fn handle_error(&self, err: NetError) {
    let _destroy = DestroyOnDrop(self.clone());
    let handler = self.inner.events.lock().error_handler();
    match handler {
      Some(handler) => handler(&err),
      None => panic!("unhandled connection error: {err}"),
    }
  }

  // ----- pre-connect queue -----

  /// Append to the pre-connect queue if the connection has not yet
  /// connected. Returns `true` if the bytes were queued.
  pub(crate) fn queue_write_if_needed(&self, data: &[u8]) -> bool {
    let mut write = self.inner.write.lock();
    match write.queue.as_mut() {
      Some(queue) => {
        if !data.is_empty() {
          queue.push(data.to_vec());
        }
        true
      }
      None => false,
    }
  }

  /// Pop every queued pre-connect chunk in order and write it out, then
  /// drop the queue. Runs on the worker as part of connect dispatch.
  fn flush_write_queue(&self) {
    loop {
      let chunk = {
        let mut write = self.inner.write.lock();
        match write.queue.as_mut() {
          Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
          Some(_) => {
            write.queue = None;
            None
          }
          None => None,
        }
      };
      match chunk {
        Some(data) => self.inner.io.write_buffered(self, &data, true, true),
        None => break,
      }
    }
  }

  // ----- write backlog machinery -----

  pub(crate) fn write_state(&self) -> MutexGuard<'_, WriteState> {
    self.inner.write.lock()
  }

  pub(crate) fn provider_read(
    &self,
    buf: &mut [u8],
  ) -> std::io::Result<IoStatus> {
    self.touch_io();
    self.inner.provider.read(buf)
  }

  /// Drain the staging buffer to the socket; whatever the kernel refuses is
  /// spilled to the backlog. Returns the number of bytes accepted
  /// (including backlogged bytes).
  pub(crate) fn write_to_socket(
    &self,
    write: &mut WriteState,
  ) -> Result<usize, NetError> {
    self.touch_io();
    if !write.backlog_empty() {
      // the socket is full; do not even attempt a direct write
      return Ok(self.add_to_backlog(write));
    }
    let mut off = 0usize;
    while off < write.staging.len() {
      match self.inner.provider.write(&write.staging[off..])? {
        IoStatus::Ready(n) if n > 0 => off += n,
        _ => break,
      }
    }
    let written = off;
    if off < write.staging.len() {
      write.staging.drain(..off);
      Ok(written + self.add_to_backlog(write))
    } else {
      write.staging.clear();
      Ok(written)
    }
  }

  fn add_to_backlog(&self, write: &mut WriteState) -> usize {
    if write.staging.is_empty() {
      return 0;
    }
    let already = !write.backlog_empty();
    let chunk = std::mem::take(&mut write.staging);
    let len = chunk.len();
    write.backlog.push_back(chunk);
    if !already {
      self.inner.provider.write_backlog_started(self);
    }
    len
  }

  /// Flush the write backlog; dispatches `writable` on the non-empty to
  /// empty transition and finishes a pending graceful close. Returns
  /// `true` iff all pending data was written.
  pub(crate) fn flush_write_backlog(&self) -> bool {
    match self.flush_write_backlog_inner() {
      Ok(done) => done,
      Err(err) => {
        self.handle_error(err);
        false
      }
    }
  }

  fn flush_write_backlog_inner(&self) -> Result<bool, NetError> {
    {
      let mut write = self.inner.write.lock();
      if write.backlog_empty() {
        return Ok(true);
      }
      self.touch_io();
      if !self.drain_backlog_staging(&mut *write)? {
        return Ok(false);
      }
      while let Some(chunk) = write.backlog.pop_front() {
        write.backlog_staging = chunk;
        write.backlog_pos = 0;
        if !self.drain_backlog_staging(&mut *write)? {
          return Ok(false);
        }
      }
      write.backlog_staging.clear();
      write.backlog_pos = 0;
    }
    // the lock is released: writable dispatch and a pending close must not
    // run under it
    self.inner.provider.write_backlog_ended(self);
    self.handle_writable();
    let pending = {
      let mut write = self.inner.write.lock();
      std::mem::take(&mut write.pending_close)
    };
    if pending {
      self.close_internal();
    }
    Ok(true)
  }

  /// No chunk leaves the backlog until it fully drained; a partially
  /// written chunk stays in the backlog staging buffer.
  fn drain_backlog_staging(
    &self,
    write: &mut WriteState,
  ) -> Result<bool, NetError> {
    while write.backlog_pos < write.backlog_staging.len() {
      match self
        .inner
        .provider
        .write(&write.backlog_staging[write.backlog_pos..])?
      {
        IoStatus::Ready(n) if n > 0 => write.backlog_pos += n,
        _ => return Ok(false),
      }
    }
    Ok(true)
  }

  /// Settle a transport read outcome after all transport locks dropped.
  pub(crate) fn settle_read(
    &self,
    outcome: Result<ReadOutcome, NetError>,
  ) -> Option<Vec<u8>> {
    match outcome {
      Ok(ReadOutcome::None) => None,
      Ok(ReadOutcome::Data(data)) => Some(data),
      Ok(ReadOutcome::Connected(data)) => {
        self.handle_connect();
        data
      }
      Ok(ReadOutcome::Eof) => {
        self.destroy();
        None
      }
      Err(err) => {
        self.handle_error(err);
        None
      }
    }
  }
}
