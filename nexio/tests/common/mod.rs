#![allow(dead_code)]
//! Shared harness for the loopback integration tests: builder-constructed
//! servers and client managers, event recording, and throwaway
//! certificates. Everything goes through the crate's public surface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub use nexio::client::{
  ClientManagerBuilder, ClientTlsConfig, ConnectionParameters,
  NetClientManager,
};
pub use nexio::server::{
  NetServer, NetworkApplication, ServerBuilder, ServerTlsConfig,
  TransportType,
};
pub use nexio::{Connection, TlsAccess};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// An ephemeral TCP port, probed by binding and dropping a listener.
pub fn free_tcp_port() -> u16 {
  TcpListener::bind((LOCALHOST, 0)).unwrap().local_addr().unwrap().port()
}

/// An ephemeral UDP port, probed by binding and dropping a socket.
pub fn free_udp_port() -> u16 {
  UdpSocket::bind((LOCALHOST, 0)).unwrap().local_addr().unwrap().port()
}

/// Recorded connection event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ev {
  Connect,
  Timeout,
  Data(Vec<u8>),
  Writable,
  Close,
  Error(String),
}

/// Register recording handlers for every event of `conn`.
pub fn wire_events(conn: &Connection) -> Receiver<Ev> {
  let (tx, rx) = mpsc::channel();
  let t = tx.clone();
  conn.on_connect(move || {
    let _ = t.send(Ev::Connect);
  });
  let t = tx.clone();
  conn.on_timeout(move || {
    let _ = t.send(Ev::Timeout);
  });
  let t = tx.clone();
  conn.on_data(move |data| {
    let _ = t.send(Ev::Data(data.to_vec()));
  });
  let t = tx.clone();
  conn.on_writable(move || {
    let _ = t.send(Ev::Writable);
  });
  let t = tx.clone();
  conn.on_close(move || {
    let _ = t.send(Ev::Close);
  });
  conn.on_error(move |err| {
    let _ = tx.send(Ev::Error(err.to_string()));
  });
  rx
}

/// Wait for the next event, panicking after `timeout`.
pub fn expect_event(rx: &Receiver<Ev>, timeout: Duration) -> Ev {
  match rx.recv_timeout(timeout) {
    Ok(ev) => ev,
    Err(RecvTimeoutError::Timeout) => panic!("no event within {timeout:?}"),
    Err(RecvTimeoutError::Disconnected) => panic!("event channel dropped"),
  }
}

/// Collect `data` payloads until their total size reaches `total` bytes;
/// other events are returned alongside.
pub fn collect_data(
  rx: &Receiver<Ev>,
  total: usize,
  timeout: Duration,
) -> (Vec<u8>, Vec<Ev>) {
  let deadline = Instant::now() + timeout;
  let mut data = Vec::new();
  let mut other = Vec::new();
  while data.len() < total {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
      Ok(Ev::Data(chunk)) => data.extend_from_slice(&chunk),
      Ok(ev) => other.push(ev),
      Err(_) => panic!(
        "received only {} of {} bytes within {timeout:?}",
        data.len(),
        total
      ),
    }
  }
  (data, other)
}

pub struct RunningServer {
  pub server: Arc<dyn NetServer>,
  pub addr: SocketAddr,
  handle: Option<JoinHandle<()>>,
}

impl RunningServer {
  pub fn shutdown(mut self) {
    let _ = self.server.close();
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

/// Build, init and run a server on its own thread.
pub fn start_server(builder: ServerBuilder) -> RunningServer {
  let server: Arc<dyn NetServer> = Arc::from(builder.build().unwrap());
  server.init().unwrap();
  let addr = server.local_addrs()[0];
  let runner = server.clone();
  let handle = std::thread::spawn(move || {
    let _ = runner.start();
  });
  RunningServer { server, addr, handle: Some(handle) }
}

pub fn start_tcp_server(
  tls: Option<Arc<rustls::ServerConfig>>,
  idle_timeout_secs: u64,
) -> RunningServer {
  let mut builder = ServerBuilder::new()
    .bind_addresses(vec![LOCALHOST])
    .ports(vec![free_tcp_port()])
    .connection_idle_timeout(idle_timeout_secs);
  if let Some(config) = tls {
    builder = builder.tls_config(ServerTlsConfig::Stream(config));
  }
  start_server(builder)
}

pub fn start_udp_server(
  tls: Option<SslContextBuilder>,
  idle_timeout_secs: u64,
  receive_buffer_size: usize,
) -> RunningServer {
  let mut builder = ServerBuilder::new()
    .transport_type(TransportType::Datagram)
    .bind_addresses(vec![LOCALHOST])
    .ports(vec![free_udp_port()])
    .connection_idle_timeout(idle_timeout_secs)
    .receive_buffer_size(receive_buffer_size);
  if let Some(context) = tls {
    builder = builder.tls_config(ServerTlsConfig::Datagram(context));
  }
  start_server(builder)
}

pub struct RunningManager {
  pub manager: Arc<dyn NetClientManager>,
  handle: Option<JoinHandle<()>>,
}

impl RunningManager {
  pub fn shutdown(mut self) {
    let _ = self.manager.close();
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

/// Build, init and run a client manager on its own thread.
pub fn start_manager(builder: ClientManagerBuilder) -> RunningManager {
  let manager: Arc<dyn NetClientManager> = Arc::from(builder.build().unwrap());
  manager.init().unwrap();
  let runner = manager.clone();
  let handle = std::thread::spawn(move || {
    let _ = runner.start();
  });
  RunningManager { manager, handle: Some(handle) }
}

pub fn start_tcp_manager(
  tls: Option<Arc<rustls::ClientConfig>>,
) -> RunningManager {
  let mut builder = ClientManagerBuilder::new();
  if let Some(config) = tls {
    builder = builder.tls_config(ClientTlsConfig::Stream(config));
  }
  start_manager(builder)
}

pub fn start_udp_manager(tls: Option<SslContext>) -> RunningManager {
  let mut builder =
    ClientManagerBuilder::new().transport_type(TransportType::Datagram);
  if let Some(context) = tls {
    builder = builder.tls_config(ClientTlsConfig::Datagram(context));
  }
  start_manager(builder)
}

/// Echo every received byte back to the peer.
pub fn echo_callback() -> nexio::server::ConnectionCallback {
  Arc::new(|conn| {
    let echo = conn.clone();
    conn.on_data(move |data| echo.write(data));
  })
}

// ----- throwaway certificates -----

pub struct TestCert {
  pub cert: X509,
  pub key: PKey<Private>,
  pub cert_der: Vec<u8>,
  pub key_pkcs8: Vec<u8>,
}

pub fn generate_cert() -> TestCert {
  let rsa = Rsa::generate(2048).unwrap();
  let key = PKey::from_rsa(rsa).unwrap();

  let mut name = X509Name::builder().unwrap();
  name.append_entry_by_text("CN", "localhost").unwrap();
  let name = name.build();

  let mut builder = X509::builder().unwrap();
  builder.set_version(2).unwrap();
  let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
  builder.set_serial_number(&serial).unwrap();
  builder.set_subject_name(&name).unwrap();
  builder.set_issuer_name(&name).unwrap();
  builder.set_pubkey(&key).unwrap();
  builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
  builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
  let san = SubjectAlternativeName::new()
    .dns("localhost")
    .ip("127.0.0.1")
    .build(&builder.x509v3_context(None, None))
    .unwrap();
  builder.append_extension(san).unwrap();
  builder.sign(&key, MessageDigest::sha256()).unwrap();
  let cert = builder.build();

  let cert_der = cert.to_der().unwrap();
  let key_pkcs8 = key.private_key_to_pkcs8().unwrap();
  TestCert { cert, key, cert_der, key_pkcs8 }
}

pub fn tls_server_config(cert: &TestCert) -> Arc<rustls::ServerConfig> {
  let certs = vec![CertificateDer::from(cert.cert_der.clone())];
  let key =
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pkcs8.clone()));
  Arc::new(nexio::build_server_config(certs, key, None).unwrap())
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &rustls::pki_types::ServerName<'_>,
    _ocsp_response: &[u8],
    _now: rustls::pki_types::UnixTime,
  ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::danger::ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
  {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
  {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
    nexio::crypto_provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}

/// Client configuration that accepts the throwaway server certificate.
pub fn tls_client_config() -> Arc<rustls::ClientConfig> {
  let versions = nexio::enabled_protocol_versions();
  let config = rustls::ClientConfig::builder_with_provider(Arc::new(
    nexio::crypto_provider(),
  ))
  .with_protocol_versions(&versions)
  .unwrap()
  .dangerous()
  .with_custom_certificate_verifier(Arc::new(NoVerify))
  .with_no_client_auth();
  Arc::new(config)
}

pub fn dtls_server_context(cert: &TestCert) -> SslContextBuilder {
  let mut builder = SslContext::builder(SslMethod::dtls()).unwrap();
  builder.set_certificate(&cert.cert).unwrap();
  builder.set_private_key(&cert.key).unwrap();
  builder
}

pub fn dtls_client_context() -> SslContext {
  let mut builder = SslContext::builder(SslMethod::dtls()).unwrap();
  builder.set_verify(SslVerifyMode::NONE);
  builder.build()
}
