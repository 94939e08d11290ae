//! TCP client manager: connect orchestration for outgoing stream
//! connections, plain or TLS.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use socket2::{Domain, Socket, Type};
use tracing::{trace, warn};

use crate::conn::plain::PlainTransport;
use crate::conn::provider::StreamProvider;
use crate::conn::tls::TlsTransport;
use crate::conn::{Connection, Transport};
use crate::error::NetError;
use crate::event::WorkerCreator;
use crate::selector::key::{Attachment, SelectionKey};
use crate::selector::poller::{Ready, OP_CONNECT, OP_READ};
use crate::selector::{ConnectionSelector, SelectorTarget};
use crate::sync::Mutex;

use super::{ConnectionParameters, NetClientManager};
use crate::server::NetworkApplication;

/// TCP implementation of a [`NetClientManager`].
pub struct TcpClientManager {
  csel: Arc<ConnectionSelector>,
  tls: Option<Arc<rustls::ClientConfig>>,
  worker_creator: Option<WorkerCreator>,
  /// Keys whose connect completed synchronously; drained by the loop so the
  /// `connect` dispatch looks the same as the asynchronous case.
  completed_connections: Arc<Mutex<Vec<Arc<SelectionKey>>>>,
}

impl TcpClientManager {
  pub(crate) fn new(
    worker_creator: Option<WorkerCreator>,
    tls: Option<Arc<rustls::ClientConfig>>,
  ) -> Result<Self, NetError> {
    Ok(Self {
      csel: ConnectionSelector::new()?,
      tls,
      worker_creator,
      completed_connections: Arc::new(Mutex::new(Vec::new())),
    })
  }

  /// Rearm the key for reads and run the transport's connect hook.
  fn finish_connect(&self, key: &Arc<SelectionKey>) {
    {
      let _guard = key.lock();
      if !key.is_valid() {
        return;
      }
      key.set_interest(OP_READ);
    }
    if let Some(conn) = key.attached_connection() {
      conn.transport_connected();
    }
  }
}

/// SNI name for the engine: the first requested server name, or the remote
/// IP address.
fn server_name_for(
  params: &ConnectionParameters,
) -> Result<ServerName<'static>, NetError> {
  match params.server_names.as_ref().and_then(|names| names.first()) {
    Some(name) => ServerName::try_from(name.clone()).map_err(|_| {
      NetError::Config(format!("invalid server name: {name}"))
    }),
    None => Ok(ServerName::IpAddress(params.remote.ip().into())),
  }
}

fn client_config_for(
  base: &Arc<rustls::ClientConfig>,
  params: &ConnectionParameters,
) -> Arc<rustls::ClientConfig> {
  match &params.alpn_names {
    Some(names) => {
      let mut config = (**base).clone();
      config.alpn_protocols = crate::conn::tls::alpn_protocol_list(names);
      Arc::new(config)
    }
    None => base.clone(),
  }
}

impl NetworkApplication for TcpClientManager {
  fn init(&self) -> Result<(), NetError> {
    Ok(())
  }

  fn start(&self) -> Result<(), NetError> {
    self.csel.selector().run_loop(self)
  }

  fn close(&self) -> Result<(), NetError> {
    self.csel.selector().close();
    Ok(())
  }
}

impl NetClientManager for TcpClientManager {
  fn connection(
    &self,
    params: ConnectionParameters,
  ) -> Result<Connection, NetError> {
    let remote = params.remote;
    let sock = Socket::new(Domain::for_address(remote), Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    if let Some(local) = params.local {
      sock.bind(&local.into())?;
    }

    // the connect path arms OP_CONNECT itself; until then, no interests
    let key = self.csel.selector().register_channel(sock.as_raw_fd(), 0)?;
    let provider = StreamProvider::new(sock, key.clone());
    let io: Box<dyn Transport> = match &self.tls {
      None => Box::new(PlainTransport::new()),
      Some(base) => {
        let config = client_config_for(base, &params);
        let name = server_name_for(&params)?;
        Box::new(TlsTransport::client(config, name)?)
      }
    };
    let conn = Connection::create(
      key.clone(),
      Box::new(provider),
      io,
      Some(remote),
      params.local,
    );
    key.attach(Attachment::Conn(conn.clone()));

    let csel = self.csel.clone();
    conn.set_on_local_close(Box::new(move |c| {
      csel.connection_closed(c.clone());
    }));

    if let Some(creator) = &self.worker_creator {
      conn.set_worker(creator(&conn));
    }

    let weak = conn.downgrade();
    conn.set_default_error_handler(Arc::new(move |err| {
      let remote = weak.upgrade().and_then(|c| c.apparent_remote_address());
      warn!(?remote, "socket error: {err}");
    }));

    let completed = self.completed_connections.clone();
    let selector = self.csel.selector().clone();
    let connect_key = key.clone();
    conn.set_on_local_connect(Box::new(move |_c| {
      completed.lock().push(connect_key.clone());
      selector.wakeup();
    }));

    Ok(conn)
  }
}

impl SelectorTarget for TcpClientManager {
  fn loop_iteration(&self) -> Result<(), NetError> {
    self.csel.drain_closed(|conn| conn.handle_close());
    let completed: Vec<Arc<SelectionKey>> =
      std::mem::take(&mut *self.completed_connections.lock());
    for key in completed {
      trace!("handling local connect");
      self.finish_connect(&key);
    }
    Ok(())
  }

  fn handle_key(
    &self,
    key: &Arc<SelectionKey>,
    ready: Ready,
  ) -> Result<(), NetError> {
    let Some(conn) = key.attached_connection() else {
      return Err(NetError::InvalidKeyState);
    };
    if key.interest() & OP_CONNECT != 0 && ready.writable {
      match conn.finish_transport_connect() {
        Ok(()) => self.finish_connect(key),
        Err(err) => conn.handle_error(err.into()),
      }
    } else if ready.readable {
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
