//! UDP client manager: per-connection datagram sockets, kernel-connected to
//! their remote, plain or DTLS.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use openssl::ssl::SslContext;
use socket2::{Domain, Socket, Type};
use tracing::warn;

use crate::conn::dtls::DtlsTransport;
use crate::conn::plain::PlainTransport;
use crate::conn::provider::DatagramProvider;
use crate::conn::{Connection, Transport};
use crate::error::NetError;
use crate::event::WorkerCreator;
use crate::selector::key::{Attachment, SelectionKey};
use crate::selector::poller::{Ready, OP_READ};
use crate::selector::{ConnectionSelector, SelectorTarget};

use super::{ConnectionParameters, NetClientManager};
use crate::server::NetworkApplication;

/// UDP implementation of a [`NetClientManager`].
pub struct UdpClientManager {
  csel: Arc<ConnectionSelector>,
  tls: Option<SslContext>,
  worker_creator: Option<WorkerCreator>,
}

impl UdpClientManager {
  pub(crate) fn new(
    worker_creator: Option<WorkerCreator>,
    tls: Option<SslContext>,
  ) -> Result<Self, NetError> {
    Ok(Self { csel: ConnectionSelector::new()?, tls, worker_creator })
  }
}

impl NetworkApplication for UdpClientManager {
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

impl NetClientManager for UdpClientManager {
  fn connection(
    &self,
    params: ConnectionParameters,
  ) -> Result<Connection, NetError> {
    let remote = params.remote;
    let sock = Socket::new(Domain::for_address(remote), Type::DGRAM, None)?;
    sock.set_nonblocking(true)?;
    if let Some(local) = params.local {
      sock.bind(&local.into())?;
    }

    let key = self.csel.selector().register_channel(sock.as_raw_fd(), 0)?;
    let provider = DatagramProvider::new(sock, key.clone());
    let io: Box<dyn Transport> = match &self.tls {
      None => Box::new(PlainTransport::new()),
      Some(context) => Box::new(DtlsTransport::client(
        context,
        params
          .server_names
          .as_ref()
          .and_then(|names| names.first())
          .map(String::as_str),
      )?),
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
      warn!(?remote, "udp socket error: {err}");
    }));

    // only start listening for reads once connect is called
    let connect_key = key.clone();
    let selector = self.csel.selector().clone();
    conn.set_on_local_connect(Box::new(move |c| {
      {
        let _guard = connect_key.lock();
        if connect_key.is_valid() {
          connect_key.set_interest(OP_READ);
        }
      }
      selector.wakeup();
      c.transport_connected();
    }));

    Ok(conn)
  }
}

impl SelectorTarget for UdpClientManager {
  fn loop_iteration(&self) -> Result<(), NetError> {
    self.csel.drain_closed(|conn| conn.handle_close());
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
