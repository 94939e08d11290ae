//! Servers: bound acceptors producing connections, and the builder that
//! configures them.

pub(crate) mod tcp;
pub(crate) mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::conn::Connection;
use crate::error::NetError;
use crate::event::WorkerCreator;

pub use tcp::TcpServer;
pub use udp::UdpServer;

/// Handler invoked for every new connection, on the connection's worker.
pub type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Common lifecycle of servers and client managers.
pub trait NetworkApplication: Send + Sync {
  /// Bind sockets and prepare the readiness loop.
  fn init(&self) -> Result<(), NetError>;

  /// Run the readiness loop. Blocks until [`close`](Self::close) is called.
  fn start(&self) -> Result<(), NetError>;

  /// Stop the loop and release all sockets. Idempotent; callable from any
  /// thread.
  fn close(&self) -> Result<(), NetError>;
}

/// A bound acceptor owning listening sockets and the set of live accepted
/// connections.
pub trait NetServer: NetworkApplication {
  /// Set the handler invoked for each new connection. Must be set before
  /// traffic arrives.
  fn set_connection_callback(&self, callback: ConnectionCallback);

  /// Addresses this server is bound to (resolved, after `init`).
  fn local_addrs(&self) -> Vec<SocketAddr>;
}

/// Transport of a server or client manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportType {
  Stream,
  Datagram,
}

/// Engine configuration for encrypted servers; must match the transport.
pub enum ServerTlsConfig {
  /// TLS for stream transports.
  Stream(Arc<rustls::ServerConfig>),
  /// DTLS for datagram transports. The builder form is taken so the server
  /// can install ALPN selection before freezing the context.
  Datagram(openssl::ssl::SslContextBuilder),
}

/// Builder for [`NetServer`] instances.
///
/// Recognized options follow the common server surface: transport type,
/// encryption, worker creator, bind addresses, ports, connection backlog,
/// idle timeout, ALPN names and the datagram receive buffer size.
pub struct ServerBuilder {
  transport_type: TransportType,
  encrypted: bool,
  tls: Option<ServerTlsConfig>,
  worker_creator: Option<WorkerCreator>,
  bind_addresses: Vec<IpAddr>,
  ports: Vec<u16>,
  listen_path: Option<PathBuf>,
  connection_backlog: u32,
  connection_idle_timeout: u64,
  application_layer_protocols: Option<Vec<String>>,
  receive_buffer_size: usize,
}

impl Default for ServerBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ServerBuilder {
  pub fn new() -> Self {
    Self {
      transport_type: TransportType::Stream,
      encrypted: false,
      tls: None,
      worker_creator: None,
      bind_addresses: Vec::new(),
      ports: Vec::new(),
      listen_path: None,
      connection_backlog: 0,
      connection_idle_timeout: 0,
      application_layer_protocols: None,
      receive_buffer_size: 8192,
    }
  }

  /// Default is [`TransportType::Stream`].
  pub fn transport_type(mut self, transport_type: TransportType) -> Self {
    self.transport_type = transport_type;
    self
  }

  pub fn encrypted(mut self, encrypted: bool) -> Self {
    self.encrypted = encrypted;
    self
  }

  /// Set the engine configuration; implicitly enables encryption.
  pub fn tls_config(mut self, config: ServerTlsConfig) -> Self {
    self.tls = Some(config);
    self.encrypted = true;
    self
  }

  /// Worker factory producing a per-connection worker.
  pub fn worker_creator(mut self, creator: WorkerCreator) -> Self {
    self.worker_creator = Some(creator);
    self
  }

  /// Local addresses to bind; empty means the wildcard address.
  pub fn bind_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
    self.bind_addresses = addresses;
    self
  }

  pub fn ports(mut self, ports: Vec<u16>) -> Self {
    self.ports = ports;
    self
  }

  /// Filesystem path for local-socket servers. Not supported by this
  /// implementation; mutually exclusive with `ports`.
  pub fn listen_path(mut self, path: PathBuf) -> Self {
    self.listen_path = Some(path);
    self
  }

  /// Pending-connection queue length for stream servers; 0 uses a default.
  pub fn connection_backlog(mut self, backlog: u32) -> Self {
    self.connection_backlog = backlog;
    self
  }

  /// Seconds a connection may stay without traffic; 0 disables.
  pub fn connection_idle_timeout(mut self, seconds: u64) -> Self {
    self.connection_idle_timeout = seconds;
    self
  }

  /// Supported ALPN names, most-preferred first.
  pub fn application_layer_protocols(mut self, names: Vec<String>) -> Self {
    self.application_layer_protocols = Some(names);
    self
  }

  /// Datagram receive buffer size; should cover the largest expected
  /// packet.
  pub fn receive_buffer_size(mut self, size: usize) -> Self {
    self.receive_buffer_size = size;
    self
  }

  pub fn build(self) -> Result<Box<dyn NetServer>, NetError> {
    if self.listen_path.is_some() {
      return Err(NetError::Unsupported(
        "this implementation does not support local filesystem servers \
         (listen_path)",
      ));
    }
    if self.ports.is_empty() || self.ports.contains(&0) {
      return Err(NetError::Config(
        "at least one positive port is required".into(),
      ));
    }
    if !self.encrypted {
      if self.tls.is_some() {
        return Err(NetError::Config(
          "tls_config cannot be set if encryption is not enabled".into(),
        ));
      }
      if self.application_layer_protocols.is_some() {
        return Err(NetError::Unsupported(
          "application_layer_protocols is only supported for tls servers",
        ));
      }
    }
    let bind_addresses = if self.bind_addresses.is_empty() {
      vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
    } else {
      self.bind_addresses
    };
    let idle_timeout_ms = self.connection_idle_timeout * 1000;

    match self.transport_type {
      TransportType::Stream => {
        let tls = match self.tls {
          None => None,
          Some(ServerTlsConfig::Stream(config)) => {
            Some(apply_server_alpn(
              config,
              self.application_layer_protocols.as_deref(),
            ))
          }
          Some(ServerTlsConfig::Datagram(_)) => {
            return Err(NetError::Config(
              "stream transport requires a tls (rustls) server \
               configuration"
                .into(),
            ))
          }
        };
        if self.encrypted && tls.is_none() {
          return Err(NetError::Config(
            "tls_config must be given with encryption enabled".into(),
          ));
        }
        Ok(Box::new(TcpServer::new(
          bind_addresses,
          self.ports,
          self.connection_backlog,
          self.worker_creator,
          idle_timeout_ms,
          tls,
        )?))
      }
      TransportType::Datagram => {
        let tls = match self.tls {
          None => None,
          Some(ServerTlsConfig::Datagram(mut builder)) => {
            if let Some(names) = &self.application_layer_protocols {
              let wire: &'static [u8] = Box::leak(
                crate::conn::dtls::alpn_wire_format(names).into_boxed_slice(),
              );
              builder.set_alpn_select_callback(move |_ssl, client| {
                openssl::ssl::select_next_proto(wire, client)
                  .ok_or(openssl::ssl::AlpnError::NOACK)
              });
            }
            Some(builder.build())
          }
          Some(ServerTlsConfig::Stream(_)) => {
            return Err(NetError::Config(
              "datagram transport requires a dtls (openssl) context".into(),
            ))
          }
        };
        if self.encrypted && tls.is_none() {
          return Err(NetError::Config(
            "tls_config must be given with encryption enabled".into(),
          ));
        }
        Ok(Box::new(UdpServer::new(
          bind_addresses,
          self.ports,
          self.worker_creator,
          idle_timeout_ms,
          self.receive_buffer_size,
          tls,
        )?))
      }
    }
  }
}

fn apply_server_alpn(
  config: Arc<rustls::ServerConfig>,
  alpn: Option<&[String]>,
) -> Arc<rustls::ServerConfig> {
  match alpn {
    Some(names) => {
      let mut owned = (*config).clone();
      owned.alpn_protocols = crate::conn::tls::alpn_protocol_list(names);
      Arc::new(owned)
    }
    None => config,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn build_rejects_missing_ports() {
    let err = ServerBuilder::new().build().err().unwrap();
    assert!(matches!(err, NetError::Config(_)));
  }

  #[test]
  fn build_rejects_listen_path() {
    let err = ServerBuilder::new()
      .ports(vec![4000])
      .listen_path(PathBuf::from("/tmp/sock"))
      .build()
      .err().unwrap();
    assert!(matches!(err, NetError::Unsupported(_)));
  }

  #[test]
  fn build_rejects_alpn_without_encryption() {
    let err = ServerBuilder::new()
      .ports(vec![4000])
      .application_layer_protocols(vec!["h2".into()])
      .build()
      .err().unwrap();
    assert!(matches!(err, NetError::Unsupported(_)));
  }

  #[test]
  fn build_rejects_encryption_without_config() {
    let err = ServerBuilder::new()
      .ports(vec![4000])
      .encrypted(true)
      .build()
      .err().unwrap();
    assert!(matches!(err, NetError::Config(_)));
  }

  #[test]
  fn build_plain_servers() {
    assert!(ServerBuilder::new().ports(vec![4000]).build().is_ok());
    assert!(ServerBuilder::new()
      .transport_type(TransportType::Datagram)
      .ports(vec![4000])
      .build()
      .is_ok());
  }
}
