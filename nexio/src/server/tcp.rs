//! TCP server: accept orchestration, idle-timeout sweeping and readiness
//! dispatch for stream connections, plain or TLS.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::config;
use crate::conn::plain::PlainTransport;
use crate::conn::provider::StreamProvider;
use crate::conn::tls::TlsTransport;
use crate::conn::{Connection, Transport};
use crate::error::NetError;
use crate::event::WorkerCreator;
use crate::selector::key::{Attachment, SelectionKey};
use crate::selector::poller::{Ready, OP_READ};
use crate::selector::{ConnectionSelector, SelectorTarget};
use crate::sync::Mutex;

use super::{ConnectionCallback, NetServer, NetworkApplication};

/// Interval of the idle-timeout sweep.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct Listener {
  sock: Socket,
  key: Arc<SelectionKey>,
  addr: SocketAddr,
}

/// TCP implementation of a [`NetServer`].
pub struct TcpServer {
  csel: Arc<ConnectionSelector>,
  tls: Option<Arc<rustls::ServerConfig>>,
  worker_creator: Option<WorkerCreator>,
  bind_addresses: Vec<IpAddr>,
  ports: Vec<u16>,
  backlog: u32,
  idle_timeout_ms: AtomicU64,
  on_new_connection: Mutex<Option<ConnectionCallback>>,
  listeners: Mutex<Vec<Listener>>,
  /// Live accepted connections, needed only for the idle-timeout sweep.
  connections: Mutex<HashMap<usize, Connection>>,
  next_sweep: AtomicU64,
}

impl TcpServer {
  pub(crate) fn new(
    bind_addresses: Vec<IpAddr>,
    ports: Vec<u16>,
    backlog: u32,
    worker_creator: Option<WorkerCreator>,
    idle_timeout_ms: u64,
    tls: Option<Arc<rustls::ServerConfig>>,
  ) -> Result<Self, NetError> {
    Ok(Self {
      csel: ConnectionSelector::new()?,
      tls,
      worker_creator,
      bind_addresses,
      ports,
      backlog,
      idle_timeout_ms: AtomicU64::new(idle_timeout_ms),
      on_new_connection: Mutex::new(None),
      listeners: Mutex::new(Vec::new()),
      connections: Mutex::new(HashMap::new()),
      next_sweep: AtomicU64::new(0),
    })
  }

  /// Idle timeout in milliseconds; 0 disables. May be changed at runtime.
  pub fn set_idle_timeout(&self, timeout_ms: u64) {
    self.idle_timeout_ms.store(timeout_ms, Ordering::Relaxed);
  }

  pub fn idle_timeout(&self) -> u64 {
    self.idle_timeout_ms.load(Ordering::Relaxed)
  }

  fn is_listener(&self, token: u64) -> bool {
    self.listeners.lock().iter().any(|l| l.key.token() == token)
  }

  fn accept_connection(
    &self,
    server_key: &Arc<SelectionKey>,
  ) -> Result<(), NetError> {
    let accepted = {
      let listeners = self.listeners.lock();
      let Some(listener) =
        listeners.iter().find(|l| l.key.token() == server_key.token())
      else {
        return Ok(());
      };
      listener.sock.accept()
    };
    let (sock, addr) = match accepted {
      Ok(pair) => pair,
      Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
        warn!("received accept readiness but no socket is available");
        return Ok(());
      }
      Err(err) => return Err(err.into()),
    };
    sock.set_nonblocking(true)?;
    let remote = addr.as_socket();
    let local = sock.local_addr().ok().and_then(|a| a.as_socket());

    let key =
      self.csel.selector().register_channel(sock.as_raw_fd(), OP_READ)?;
    let provider = StreamProvider::new(sock, key.clone());
    let io: Box<dyn Transport> = match &self.tls {
      None => Box::new(PlainTransport::new()),
      Some(config) => Box::new(TlsTransport::server(config.clone())?),
    };
    let conn =
      Connection::create(key.clone(), Box::new(provider), io, remote, local);
    key.attach(Attachment::Conn(conn.clone()));

    let csel = self.csel.clone();
    conn.set_on_local_close(Box::new(move |c| {
      csel.connection_closed(c.clone());
    }));

    if let Some(creator) = &self.worker_creator {
      conn.set_worker(creator(&conn));
    }

    // the connect event dispatches the user's new-connection handler
    let callback = self.on_new_connection.lock().clone();
    let weak = conn.downgrade();
    conn.on_connect(move || {
      let Some(conn) = weak.upgrade() else { return };
      match &callback {
        Some(callback) => callback(&conn),
        None => panic!("no connection handler is set"),
      }
    });

    if self.tls.is_some() {
      // client misbehavior during the handshake is logged quieter
      let weak = conn.downgrade();
      conn.set_default_error_handler(Arc::new(move |err| {
        let remote =
          weak.upgrade().and_then(|c| c.apparent_remote_address());
        if err.is_handshake_failure() {
          debug!(?remote, "tls handshake failed: {err}");
        } else {
          warn!(?remote, "socket error: {err}");
        }
      }));
    }

    conn.transport_connected();
    self.connections.lock().insert(conn.id(), conn);
    Ok(())
  }

  fn sweep_idle(&self) {
    let now = config::now_millis();
    if now < self.next_sweep.load(Ordering::Relaxed) {
      return;
    }
    self
      .next_sweep
      .store(now + SWEEP_INTERVAL.as_millis() as u64, Ordering::Relaxed);
    // checked on every sweep because it may change at runtime
    let timeout = self.idle_timeout_ms.load(Ordering::Relaxed);
    if timeout == 0 {
      return;
    }
    let result = catch_unwind(AssertUnwindSafe(|| {
      let conns: Vec<Connection> =
        self.connections.lock().values().cloned().collect();
      for conn in conns {
        let delta = now as i64 - conn.last_io_time() as i64;
        if delta < 0 || delta as u64 > timeout {
          debug!(remote = ?conn.remote_address(), delta, "idle timeout");
          conn.close();
        }
      }
    }));
    if result.is_err() {
      warn!("error while checking idle timeouts");
    }
  }
}

impl NetworkApplication for TcpServer {
  fn init(&self) -> Result<(), NetError> {
    for port in &self.ports {
      for bind_address in &self.bind_addresses {
        let addr = SocketAddr::new(*bind_address, *port);
        let sock =
          Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        let backlog =
          if self.backlog == 0 { 128 } else { self.backlog as i32 };
        sock.listen(backlog)?;
        sock.set_nonblocking(true)?;
        let local = sock.local_addr()?.as_socket().unwrap_or(addr);
        let key =
          self.csel.selector().register_channel(sock.as_raw_fd(), OP_READ)?;
        info!("listening tcp on {local}");
        self.listeners.lock().push(Listener { sock, key, addr: local });
      }
    }
    self.csel.selector().set_tick_interval(Some(SWEEP_INTERVAL));
    self.next_sweep.store(
      config::now_millis() + SWEEP_INTERVAL.as_millis() as u64,
      Ordering::Relaxed,
    );
    Ok(())
  }

  fn start(&self) -> Result<(), NetError> {
    self.csel.selector().run_loop(self)
  }

  fn close(&self) -> Result<(), NetError> {
    for listener in self.listeners.lock().drain(..) {
      listener.key.cancel();
    }
    self.csel.selector().close();
    Ok(())
  }
}

impl NetServer for TcpServer {
  fn set_connection_callback(&self, callback: ConnectionCallback) {
    *self.on_new_connection.lock() = Some(callback);
  }

  fn local_addrs(&self) -> Vec<SocketAddr> {
    self.listeners.lock().iter().map(|l| l.addr).collect()
  }
}

impl SelectorTarget for TcpServer {
  fn loop_iteration(&self) -> Result<(), NetError> {
    self.csel.drain_closed(|conn| {
      if self.connections.lock().remove(&conn.id()).is_none() {
        warn!(
          remote = ?conn.remote_address(),
          "closed connection was not in the connection list"
        );
      }
      conn.handle_close();
    });
    self.sweep_idle();
    Ok(())
  }

  fn handle_key(
    &self,
    key: &Arc<SelectionKey>,
    ready: Ready,
  ) -> Result<(), NetError> {
    if self.is_listener(key.token()) {
      if ready.readable {
        self.accept_connection(key)?;
      }
      return Ok(());
    }
    let Some(conn) = key.attached_connection() else {
      return Err(NetError::InvalidKeyState);
    };
    if ready.readable {
      if let Some(data) = conn.read() {
        conn.handle_data(data);
      }
    } else if ready.writable {
      conn.flush_write_backlog();
    } else {
      return Err(NetError::InvalidKeyState);
    }
    Ok(())
  }
}
