//! TLS connections: record framing through the rustls engine.
//!
//! Wire bytes are pumped through `read_tls`/`process_new_packets` (unwrap)
//! and `writer()`/`write_tls` (wrap). The handshake is driven by an explicit
//! state machine derived from the engine; progress happens on the I/O
//! thread as part of the read path, with produced records handed to the base
//! connection's socket-write machinery (which spills to the backlog when the
//! kernel refuses bytes).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tracing::{debug, warn};

use crate::config;
use crate::error::NetError;
use crate::sync::Mutex;

use super::buffer::ByteQueue;
use super::provider::IoStatus;
use super::{Connection, ReadOutcome, Transport, TlsAccess};

/// Initial size of the crate-owned wire read buffer.
const WIRE_BUF_INITIAL: usize = 8 * 1024;
/// Hard maximum of the wire read buffer (a few full TLS records).
const WIRE_BUF_MAX: usize = 64 * 1024;
/// Bytes of spare capacity requested before each socket read.
const READ_CHUNK: usize = 4 * 1024;
/// Safety cap on close-notify write iterations.
const CLOSE_MESSAGE_LIMIT: usize = 15;

/// Handshake progress as derived from the engine, step by step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeState {
  /// The engine needs wire bytes from the peer.
  NeedUnwrap,
  /// The engine produced records that must be written out.
  NeedWrap,
  /// The handshake is complete.
  Finished,
}

fn handshake_state(engine: &rustls::Connection) -> HandshakeState {
  if !engine.is_handshaking() {
    HandshakeState::Finished
  } else if engine.wants_write() {
    HandshakeState::NeedWrap
  } else {
    HandshakeState::NeedUnwrap
  }
}

struct TlsState {
  engine: rustls::Connection,
  incoming: ByteQueue,
  peer_closed: bool,
  close_notify_sent: bool,
}

pub(crate) struct TlsTransport {
  state: Mutex<TlsState>,
  handshake_done: AtomicBool,
}

impl TlsTransport {
  fn with_engine(engine: rustls::Connection) -> Self {
    Self {
      state: Mutex::new(TlsState {
        engine,
        incoming: ByteQueue::new(
          WIRE_BUF_INITIAL,
          WIRE_BUF_MAX,
          "tls wire read buffer",
        ),
        peer_closed: false,
        close_notify_sent: false,
      }),
      handshake_done: AtomicBool::new(false),
    }
  }

  pub fn client(
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
  ) -> Result<Self, NetError> {
    let engine = rustls::ClientConnection::new(config, server_name)
      .map_err(|err| NetError::TlsHandshake(err.to_string()))?;
    Ok(Self::with_engine(rustls::Connection::Client(engine)))
  }

  pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, NetError> {
    let engine = rustls::ServerConnection::new(config)
      .map_err(|err| NetError::TlsHandshake(err.to_string()))?;
    Ok(Self::with_engine(rustls::Connection::Server(engine)))
  }

  /// Write every record the engine has pending through the socket-write
  /// machinery.
  fn wrap_out(
    &self,
    conn: &Connection,
    state: &mut TlsState,
  ) -> Result<(), NetError> {
    while state.engine.wants_write() {
      let mut write = conn.write_state();
      state.engine.write_tls(&mut write.staging).map_err(NetError::Io)?;
      conn.write_to_socket(&mut *write)?;
    }
    Ok(())
  }

  /// Feed buffered wire bytes into the engine.
  fn unwrap_in(
    &self,
    conn: &Connection,
    state: &mut TlsState,
    handshaking: bool,
  ) -> Result<(), NetError> {
    while !state.incoming.is_empty() {
      let mut slice: &[u8] = state.incoming.filled();
      let consumed =
        state.engine.read_tls(&mut slice).map_err(NetError::Io)?;
      if consumed == 0 {
        break;
      }
      state.incoming.discard(consumed);
      if let Err(err) = state.engine.process_new_packets() {
        // flush the alert the engine queued before reporting
        let _ = self.wrap_out(conn, state);
        return Err(if handshaking {
          NetError::TlsHandshake(err.to_string())
        } else {
          NetError::TlsRecord(err.to_string())
        });
      }
    }
    Ok(())
  }

  /// Drain decrypted plaintext from the engine.
  fn take_plaintext(
    &self,
    state: &mut TlsState,
  ) -> Result<Option<Vec<u8>>, NetError> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
      match state.engine.reader().read(&mut chunk) {
        Ok(0) => {
          // clean close-notify from the peer
          state.peer_closed = true;
          break;
        }
        Ok(n) => out.extend_from_slice(&chunk[..n]),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
        Err(err) => return Err(NetError::TlsRecord(err.to_string())),
      }
    }
    Ok(if out.is_empty() { None } else { Some(out) })
  }

  /// Advance the handshake state machine as far as the available wire
  /// bytes allow.
  fn continue_handshake(
    &self,
    conn: &Connection,
    state: &mut TlsState,
  ) -> Result<ReadOutcome, NetError> {
    loop {
      match handshake_state(&state.engine) {
        HandshakeState::NeedWrap => self.wrap_out(conn, state)?,
        HandshakeState::Finished => {
          // the final flight (and any session tickets) may have been
          // queued in the same step that completed the handshake
          self.wrap_out(conn, state)?;
          break;
        }
        HandshakeState::NeedUnwrap => {
          let spare = state.incoming.spare(READ_CHUNK)?;
          match conn.provider_read(spare) {
            Ok(IoStatus::Ready(n)) if n > 0 => {
              state.incoming.advance(n);
              self.unwrap_in(conn, state, true)?;
            }
            Ok(IoStatus::Ready(_)) | Ok(IoStatus::WouldBlock) => {
              return Ok(ReadOutcome::None)
            }
            Ok(IoStatus::Closed) => return Err(NetError::HandshakeEof),
            Err(err) => return Err(err.into()),
          }
        }
      }
    }
    self.handshake_done.store(true, Ordering::Release);
    debug!(
      peer = ?conn.apparent_remote_address(),
      cipher = ?self.cipher_of(state),
      alpn = ?self.alpn_of(state),
      "tls handshake completed"
    );
    // records decrypted together with the final handshake flight
    let data = self.take_plaintext(state)?;
    Ok(ReadOutcome::Connected(data))
  }

  fn read_application(
    &self,
    conn: &Connection,
    state: &mut TlsState,
  ) -> Result<ReadOutcome, NetError> {
    let spare = state.incoming.spare(READ_CHUNK)?;
    match conn.provider_read(spare) {
      Ok(IoStatus::Ready(n)) if n > 0 => {
        state.incoming.advance(n);
        self.unwrap_in(conn, state, false)?;
      }
      Ok(IoStatus::Ready(_)) | Ok(IoStatus::WouldBlock) => {
        if !state.incoming.is_empty() {
          self.unwrap_in(conn, state, false)?;
        }
      }
      Ok(IoStatus::Closed) => return Ok(ReadOutcome::Eof),
      Err(err) => return Err(err.into()),
    }
    let data = self.take_plaintext(state)?;
    if state.peer_closed && !state.close_notify_sent {
      // reply with our own close-notify; the socket closes on EOF
      state.engine.send_close_notify();
      state.close_notify_sent = true;
    }
    // tickets, key updates or the close-notify reply
    self.wrap_out(conn, state)?;
    Ok(match data {
      Some(data) => ReadOutcome::Data(data),
      None => ReadOutcome::None,
    })
  }

  fn cipher_of(&self, state: &TlsState) -> Option<String> {
    state
      .engine
      .negotiated_cipher_suite()
      .map(|suite| format!("{:?}", suite.suite()))
  }

  fn alpn_of(&self, state: &TlsState) -> Option<String> {
    state
      .engine
      .alpn_protocol()
      .map(|proto| String::from_utf8_lossy(proto).into_owned())
      .filter(|proto| !proto.is_empty())
  }
}

impl Transport for TlsTransport {
  fn read(&self, conn: &Connection) -> Option<Vec<u8>> {
    if !conn.is_socket_connected() {
      return None;
    }
    let outcome = {
      let mut state = self.state.lock();
      if self.handshake_done.load(Ordering::Acquire) {
        self.read_application(conn, &mut *state)
      } else {
        self.continue_handshake(conn, &mut *state)
      }
    };
    conn.settle_read(outcome)
  }

  fn write_buffered(
    &self,
    conn: &Connection,
    data: &[u8],
    flush: bool,
    force: bool,
  ) {
    if !force && conn.queue_write_if_needed(data) {
      return;
    }
    let result = (|| -> Result<(), NetError> {
      let mut state = self.state.lock();
      if !data.is_empty() {
        let mut off = 0usize;
        while off < data.len() {
          let n = state
            .engine
            .writer()
            .write(&data[off..])
            .map_err(|err| NetError::TlsRecord(err.to_string()))?;
          if n == 0 {
            return Err(NetError::TlsRecord("wrap consumed no data".into()));
          }
          off += n;
        }
      }
      if flush {
        self.wrap_out(conn, &mut *state)?;
      }
      Ok(())
    })();
    if let Err(err) = result {
      conn.handle_error(err);
    }
  }

  fn flush(&self, conn: &Connection) -> bool {
    let result = {
      let mut state = self.state.lock();
      self.wrap_out(conn, &mut *state)
    };
    if let Err(err) = result {
      conn.handle_error(err);
      return false;
    }
    conn.flush_write_backlog()
  }

  fn on_socket_connect(&self, conn: &Connection) {
    let outcome = {
      let mut state = self.state.lock();
      self.continue_handshake(conn, &mut *state)
    };
    conn.settle_read(outcome);
  }

  /// Orderly close: queue close-notify and write the engine dry, bounded by
  /// a safety cap. Failures here are logged and swallowed.
  fn before_close(&self, conn: &Connection) {
    let mut state = self.state.lock();
    if !state.close_notify_sent {
      state.engine.send_close_notify();
      state.close_notify_sent = true;
    }
    if !conn.is_socket_connected() {
      return;
    }
    let mut count = 0usize;
    while state.engine.wants_write() {
      if count >= CLOSE_MESSAGE_LIMIT {
        warn!(
          peer = ?conn.apparent_remote_address(),
          "wrote {count} tls close messages, aborting"
        );
        break;
      }
      let result = (|| -> Result<(), NetError> {
        let mut write = conn.write_state();
        state.engine.write_tls(&mut write.staging).map_err(NetError::Io)?;
        conn.write_to_socket(&mut *write)?;
        Ok(())
      })();
      if let Err(err) = result {
        debug!("error while writing tls close message: {err}");
        break;
      }
      count += 1;
    }
  }

  fn is_connected(&self, conn: &Connection) -> bool {
    conn.is_socket_connected() && self.handshake_done.load(Ordering::Acquire)
  }

  fn tls(&self) -> Option<&dyn TlsAccess> {
    Some(self)
  }
}

impl TlsAccess for TlsTransport {
  fn protocol(&self) -> Option<String> {
    let state = self.state.lock();
    state.engine.protocol_version().map(|version| {
      match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{other:?}"),
      }
    })
  }

  fn cipher(&self) -> Option<String> {
    let state = self.state.lock();
    self.cipher_of(&state)
  }

  fn application_protocol(&self) -> Option<String> {
    let state = self.state.lock();
    self.alpn_of(&state)
  }
}

// ----- engine configuration helpers -----

/// Protocol versions allowed by the configured minimum minor-version floor
/// (default 2, enabling TLS 1.2 and newer; SSL-family versions are never
/// enabled).
pub fn enabled_protocol_versions(
) -> Vec<&'static rustls::SupportedProtocolVersion> {
  let floor = config::tls_min_version();
  let mut versions = Vec::new();
  if floor <= 2 {
    versions.push(&rustls::version::TLS12);
  }
  if floor <= 3 {
    versions.push(&rustls::version::TLS13);
  }
  versions
}

/// Substring-based weak-cipher heuristic, preserved as an opaque policy.
fn is_weak_cipher(name: &str) -> bool {
  name.contains("CBC")
    || name.contains("ECDH_")
    || name.contains("RENEGOTIATION")
    || name.starts_with("TLS_RSA_WITH_AES_")
}

/// The crypto provider, with weak cipher families filtered out when so
/// configured.
pub fn crypto_provider() -> CryptoProvider {
  let mut provider = rustls::crypto::ring::default_provider();
  if config::tls_disable_weak_ciphers() {
    let before = provider.cipher_suites.len();
    provider
      .cipher_suites
      .retain(|suite| !is_weak_cipher(&format!("{:?}", suite.suite())));
    if provider.cipher_suites.len() < before {
      debug!(
        "reduced set of enabled cipher suites from {before} to {}",
        provider.cipher_suites.len()
      );
    }
  }
  provider
}

/// Build a server-side TLS engine configuration from a certificate chain
/// and private key, honoring the version floor and cipher filter.
pub fn build_server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  alpn: Option<&[String]>,
) -> Result<rustls::ServerConfig, NetError> {
  let versions = enabled_protocol_versions();
  let mut config =
    rustls::ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
      .with_protocol_versions(&versions)
      .map_err(|err| NetError::Config(err.to_string()))?
      .with_no_client_auth()
      .with_single_cert(cert_chain, key)
      .map_err(|err| NetError::Config(err.to_string()))?;
  if let Some(alpn) = alpn {
    config.alpn_protocols = alpn_protocol_list(alpn);
  }
  Ok(config)
}

/// Build a client-side TLS engine configuration trusting the given roots,
/// honoring the version floor and cipher filter.
pub fn build_client_config(
  roots: rustls::RootCertStore,
  alpn: Option<&[String]>,
) -> Result<rustls::ClientConfig, NetError> {
  let versions = enabled_protocol_versions();
  let mut config =
    rustls::ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
      .with_protocol_versions(&versions)
      .map_err(|err| NetError::Config(err.to_string()))?
      .with_root_certificates(roots)
      .with_no_client_auth();
  if let Some(alpn) = alpn {
    config.alpn_protocols = alpn_protocol_list(alpn);
  }
  Ok(config)
}

/// ALPN names in the representation the engine expects, preference order
/// preserved.
pub(crate) fn alpn_protocol_list(names: &[String]) -> Vec<Vec<u8>> {
  names.iter().map(|name| name.as_bytes().to_vec()).collect()
}
