//! Client managers: factories producing not-yet-connected connections on a
//! shared readiness loop.

pub(crate) mod tcp;
pub(crate) mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::conn::Connection;
use crate::error::NetError;
use crate::event::WorkerCreator;
use crate::server::{NetworkApplication, TransportType};

pub use tcp::TcpClientManager;
pub use udp::UdpClientManager;

/// Immutable descriptor of an outgoing connection.
#[derive(Clone, Debug)]
pub struct ConnectionParameters {
  pub remote: SocketAddr,
  /// Optional local bind address.
  pub local: Option<SocketAddr>,
  /// ALPN names, most-preferred first (encrypted connections only).
  pub alpn_names: Option<Vec<String>>,
  /// SNI server names (encrypted connections only).
  pub server_names: Option<Vec<String>>,
}

impl ConnectionParameters {
  pub fn new(remote: SocketAddr) -> Self {
    Self { remote, local: None, alpn_names: None, server_names: None }
  }

  pub fn with_local(mut self, local: SocketAddr) -> Self {
    self.local = Some(local);
    self
  }

  pub fn with_alpn_names(mut self, names: Vec<String>) -> Self {
    self.alpn_names = Some(names);
    self
  }

  pub fn with_server_names(mut self, names: Vec<String>) -> Self {
    self.server_names = Some(names);
    self
  }
}

/// Engine configuration for encrypted client managers; must match the
/// transport.
pub enum ClientTlsConfig {
  /// TLS for stream transports.
  Stream(Arc<rustls::ClientConfig>),
  /// DTLS for datagram transports.
  Datagram(openssl::ssl::SslContext),
}

/// A factory producing connections that are not yet connected; the returned
/// connection exposes `connect`.
pub trait NetClientManager: NetworkApplication {
  fn connection(
    &self,
    params: ConnectionParameters,
  ) -> Result<Connection, NetError>;
}

/// Builder for [`NetClientManager`] instances.
pub struct ClientManagerBuilder {
  transport_type: TransportType,
  encrypted: bool,
  tls: Option<ClientTlsConfig>,
  worker_creator: Option<WorkerCreator>,
}

impl Default for ClientManagerBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientManagerBuilder {
  pub fn new() -> Self {
    Self {
      transport_type: TransportType::Stream,
      encrypted: false,
      tls: None,
      worker_creator: None,
    }
  }

  pub fn transport_type(mut self, transport_type: TransportType) -> Self {
    self.transport_type = transport_type;
    self
  }

  pub fn encrypted(mut self, encrypted: bool) -> Self {
    self.encrypted = encrypted;
    self
  }

  /// Set the engine configuration; implicitly enables encryption.
  pub fn tls_config(mut self, config: ClientTlsConfig) -> Self {
    self.tls = Some(config);
    self.encrypted = true;
    self
  }

  pub fn worker_creator(mut self, creator: WorkerCreator) -> Self {
    self.worker_creator = Some(creator);
    self
  }

  pub fn build(self) -> Result<Box<dyn NetClientManager>, NetError> {
    if !self.encrypted && self.tls.is_some() {
      return Err(NetError::Config(
        "tls_config cannot be set if encryption is not enabled".into(),
      ));
    }
    if self.encrypted && self.tls.is_none() {
      return Err(NetError::Config(
        "tls_config must be given with encryption enabled".into(),
      ));
    }
    match self.transport_type {
      TransportType::Stream => {
        let tls = match self.tls {
          None => None,
          Some(ClientTlsConfig::Stream(config)) => Some(config),
          Some(ClientTlsConfig::Datagram(_)) => {
            return Err(NetError::Config(
              "stream transport requires a tls (rustls) client \
               configuration"
                .into(),
            ))
          }
        };
        Ok(Box::new(TcpClientManager::new(self.worker_creator, tls)?))
      }
      TransportType::Datagram => {
        let tls = match self.tls {
          None => None,
          Some(ClientTlsConfig::Datagram(context)) => Some(context),
          Some(ClientTlsConfig::Stream(_)) => {
            return Err(NetError::Config(
              "datagram transport requires a dtls (openssl) context".into(),
            ))
          }
        };
        Ok(Box::new(UdpClientManager::new(self.worker_creator, tls)?))
      }
    }
  }
}
