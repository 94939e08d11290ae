//! UDP server: synthesizes per-peer connections from shared datagram
//! sockets by keying on the remote address, plain or DTLS.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use openssl::ssl::SslContext;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::config;
use crate::conn::dtls::DtlsTransport;
use crate::conn::plain::PlainTransport;
use crate::conn::provider::PeerDatagramProvider;
use crate::conn::{Connection, Transport};
use crate::error::NetError;
use crate::event::WorkerCreator;
use crate::selector::key::SelectionKey;
use crate::selector::poller::{Ready, OP_READ, OP_WRITE};
use crate::selector::{ConnectionSelector, SelectorTarget};
use crate::sync::Mutex;

use super::tcp::SWEEP_INTERVAL;
use super::{ConnectionCallback, NetServer, NetworkApplication};

#[derive(Clone)]
struct UdpChannel {
  sock: Arc<Socket>,
  key: Arc<SelectionKey>,
  addr: SocketAddr,
}

#[derive(Clone)]
struct UdpPeer {
  conn: Connection,
  read_backlog: Arc<SegQueue<Vec<u8>>>,
}

/// UDP implementation of a [`NetServer`].
pub struct UdpServer {
  inner: Arc<UdpServerInner>,
}

struct UdpServerInner {
  me: Weak<UdpServerInner>,
  csel: Arc<ConnectionSelector>,
  tls: Option<SslContext>,
  worker_creator: Option<WorkerCreator>,
  bind_addresses: Vec<IpAddr>,
  ports: Vec<u16>,
  receive_buffer_size: usize,
  idle_timeout_ms: AtomicU64,
  on_new_connection: Mutex<Option<ConnectionCallback>>,
  channels: Mutex<Vec<UdpChannel>>,
  connections: Mutex<HashMap<SocketAddr, UdpPeer>>,
  /// Connections currently experiencing write backlog on the shared socket.
  backlogged: Mutex<Vec<Connection>>,
  /// Sized one byte larger than the receive buffer so truncation is
  /// detectable.
  recv_buf: Mutex<Vec<MaybeUninit<u8>>>,
  next_sweep: AtomicU64,
}

impl UdpServer {
  pub(crate) fn new(
    bind_addresses: Vec<IpAddr>,
    ports: Vec<u16>,
    worker_creator: Option<WorkerCreator>,
    idle_timeout_ms: u64,
    receive_buffer_size: usize,
    tls: Option<SslContext>,
  ) -> Result<Self, NetError> {
    let csel = ConnectionSelector::new()?;
    let inner = Arc::new_cyclic(|me| UdpServerInner {
      me: me.clone(),
      csel,
      tls,
      worker_creator,
      bind_addresses,
      ports,
      receive_buffer_size,
      idle_timeout_ms: AtomicU64::new(idle_timeout_ms),
      on_new_connection: Mutex::new(None),
      channels: Mutex::new(Vec::new()),
      connections: Mutex::new(HashMap::new()),
      backlogged: Mutex::new(Vec::new()),
      recv_buf: Mutex::new(vec![
        MaybeUninit::uninit();
        receive_buffer_size + 1
      ]),
      next_sweep: AtomicU64::new(0),
    });
    Ok(Self { inner })
  }

  /// Idle timeout in milliseconds; 0 disables. May be changed at runtime.
  pub fn set_idle_timeout(&self, timeout_ms: u64) {
    self.inner.idle_timeout_ms.store(timeout_ms, Ordering::Relaxed);
  }

  pub fn idle_timeout(&self) -> u64 {
    self.inner.idle_timeout_ms.load(Ordering::Relaxed)
  }
}

impl UdpServerInner {
  /// Register a connection as backlogged; the shared key's write interest
  /// is armed by the provider.
  fn write_backlog_started(&self, conn: &Connection) {
    let mut backlogged = self.backlogged.lock();
    if !backlogged.iter().any(|c| c.id() == conn.id()) {
      backlogged.push(conn.clone());
    }
  }

  /// Remove the peer from the connection map and funnel the close onto the
  /// I/O thread.
  fn peer_closed(&self, conn: &Connection) {
    if let Some(remote) = conn.remote_address() {
      if self.connections.lock().remove(&remote).is_none() {
        warn!(?remote, "closed nonexistent connection");
      }
    }
    self.csel.connection_closed(conn.clone());
  }

  fn channel_for(&self, token: u64) -> Option<UdpChannel> {
    self.channels.lock().iter().find(|c| c.key.token() == token).cloned()
  }

  /// Receive one datagram, look up or synthesize the peer connection, and
  /// push the payload into the per-peer read backlog.
  fn incoming_packet(
    &self,
    key: &Arc<SelectionKey>,
  ) -> Result<Option<Connection>, NetError> {
    let Some(channel) = self.channel_for(key.token()) else {
      return Ok(None);
    };
    let (data, remote) = {
      let mut buf = self.recv_buf.lock();
      match channel.sock.recv_from(buf.as_mut_slice()) {
        Ok((n, addr)) => {
          if n >= buf.len() {
            // the datagram filled the entire buffer: almost certainly
            // truncated
            warn!(
              "dropping too large incoming packet (>= {} bytes), set the \
               receive_buffer_size to a larger value",
              buf.len() - 1
            );
            return Ok(None);
          }
          let Some(remote) = addr.as_socket() else {
            return Ok(None);
          };
          // SAFETY: recv_from initialized the first n bytes
          let data = unsafe {
            std::slice::from_raw_parts(buf.as_ptr() as *const u8, n)
          }
          .to_vec();
          (data, remote)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
          warn!("received read readiness but no datagram is available");
          return Ok(None);
        }
        Err(err) => return Err(err.into()),
      }
    };

    let existing = self.connections.lock().get(&remote).cloned();
    let peer = match existing {
      Some(peer) => peer,
      None => {
        let peer = self.create_peer(&channel, remote)?;
        self.connections.lock().insert(remote, peer.clone());
        // fires `connect` for plaintext peers; DTLS defers to handshake
        // completion
        peer.conn.transport_connected();
        peer
      }
    };
    peer.read_backlog.push(data);
    Ok(Some(peer.conn))
  }

  fn create_peer(
    &self,
    channel: &UdpChannel,
    remote: SocketAddr,
  ) -> Result<UdpPeer, NetError> {
    let read_backlog = Arc::new(SegQueue::new());
    let me = self.me.clone();
    let provider = PeerDatagramProvider::new(
      channel.sock.clone(),
      channel.key.clone(),
      remote,
      read_backlog.clone(),
      Box::new(move |conn| {
        if let Some(server) = me.upgrade() {
          server.write_backlog_started(conn);
        }
      }),
    );
    let io: Box<dyn Transport> = match &self.tls {
      None => Box::new(PlainTransport::new()),
      Some(context) => Box::new(DtlsTransport::server(context)?),
    };
    let conn = Connection::create(
      channel.key.clone(),
      Box::new(provider),
      io,
      Some(remote),
      Some(channel.addr),
    );

    let me = self.me.clone();
    conn.set_on_local_close(Box::new(move |c| {
      if let Some(server) = me.upgrade() {
        server.peer_closed(c);
      }
    }));

    if let Some(creator) = &self.worker_creator {
      conn.set_worker(creator(&conn));
    }

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
      let weak = conn.downgrade();
      conn.set_default_error_handler(Arc::new(move |err| {
        let remote =
          weak.upgrade().and_then(|c| c.apparent_remote_address());
        if err.is_handshake_failure() {
          debug!(?remote, "dtls handshake failed: {err}");
        } else {
          warn!(?remote, "socket error: {err}");
        }
      }));
    } else {
      let weak = conn.downgrade();
      conn.set_default_error_handler(Arc::new(move |err| {
        let remote =
          weak.upgrade().and_then(|c| c.apparent_remote_address());
        warn!(?remote, "udp socket error: {err}");
      }));
    }

    Ok(UdpPeer { conn, read_backlog })
  }

  /// Flush all backlogged connections; disarm write-readiness on the
  /// shared key once none is left.
  fn flush_backlogged(&self, key: &Arc<SelectionKey>) {
    let snapshot: Vec<Connection> = self.backlogged.lock().clone();
    let mut drained = Vec::new();
    for conn in &snapshot {
      if conn.flush_write_backlog() {
        drained.push(conn.id());
      }
    }
    let all_flushed = {
      let mut backlogged = self.backlogged.lock();
      backlogged.retain(|c| !drained.contains(&c.id()));
      backlogged.is_empty()
    };
    if all_flushed {
      key.disable_op(OP_WRITE);
    }
  }

  fn sweep_idle(&self) {
    let now = config::now_millis();
    if now < self.next_sweep.load(Ordering::Relaxed) {
      return;
    }
    self
      .next_sweep
      .store(now + SWEEP_INTERVAL.as_millis() as u64, Ordering::Relaxed);
    let timeout = self.idle_timeout_ms.load(Ordering::Relaxed);
    if timeout == 0 {
      return;
    }
    let result = catch_unwind(AssertUnwindSafe(|| {
      // collect first: close() mutates the map through the local-close hook
      let expired: Vec<Connection> = {
        let connections = self.connections.lock();
        connections
          .values()
          .filter(|peer| {
            let delta = now as i64 - peer.conn.last_io_time() as i64;
            delta < 0 || delta as u64 > timeout
          })
          .map(|peer| peer.conn.clone())
          .collect()
      };
      for conn in expired {
        debug!(remote = ?conn.remote_address(), "idle timeout");
        conn.close();
      }
    }));
    if result.is_err() {
      warn!("error while checking idle timeouts");
    }
  }
}

impl NetworkApplication for UdpServer {
  fn init(&self) -> Result<(), NetError> {
    let inner = &self.inner;
    for port in &inner.ports {
      for bind_address in &inner.bind_addresses {
        let addr = SocketAddr::new(*bind_address, *port);
        let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        sock.bind(&addr.into())?;
        sock.set_nonblocking(true)?;
        let local = sock.local_addr()?.as_socket().unwrap_or(addr);
        let key = inner
          .csel
          .selector()
          .register_channel(sock.as_raw_fd(), OP_READ)?;
        info!("listening udp on {local}");
        inner.channels.lock().push(UdpChannel {
          sock: Arc::new(sock),
          key,
          addr: local,
        });
      }
    }
    inner.csel.selector().set_tick_interval(Some(SWEEP_INTERVAL));
    inner.next_sweep.store(
      config::now_millis() + SWEEP_INTERVAL.as_millis() as u64,
      Ordering::Relaxed,
    );
    Ok(())
  }

  fn start(&self) -> Result<(), NetError> {
    self.inner.csel.selector().run_loop(&*self.inner)
  }

  fn close(&self) -> Result<(), NetError> {
    for channel in self.inner.channels.lock().drain(..) {
      channel.key.cancel();
    }
    self.inner.csel.selector().close();
    Ok(())
  }
}

impl NetServer for UdpServer {
  fn set_connection_callback(&self, callback: ConnectionCallback) {
    *self.inner.on_new_connection.lock() = Some(callback);
  }

  fn local_addrs(&self) -> Vec<SocketAddr> {
    self.inner.channels.lock().iter().map(|c| c.addr).collect()
  }
}

impl SelectorTarget for UdpServerInner {
  fn loop_iteration(&self) -> Result<(), NetError> {
    self.csel.drain_closed(|conn| conn.handle_close());
    self.sweep_idle();
    Ok(())
  }

  fn handle_key(
    &self,
    key: &Arc<SelectionKey>,
    ready: Ready,
  ) -> Result<(), NetError> {
    if ready.readable {
      let Some(conn) = self.incoming_packet(key)? else {
        return Ok(());
      };
      if let Some(data) = conn.read() {
        conn.handle_data(data);
      }
    } else if ready.writable {
      self.flush_backlogged(key);
    } else {
      return Err(NetError::InvalidKeyState);
    }
    Ok(())
  }
}
