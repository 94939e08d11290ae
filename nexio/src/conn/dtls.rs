//! DTLS connections: datagram record framing through the openssl engine.
//!
//! The engine runs over an in-memory datagram transport that preserves
//! packet boundaries: inbound datagrams are queued by the read path and
//! consumed one per engine read, produced records are drained one datagram
//! at a time into the base connection's socket-write machinery. `WANT_READ`
//! from the engine maps to "need more wire datagrams"; `ZERO_RETURN` is the
//! peer's close-notify.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use openssl::error::ErrorStack;
use openssl::ssl::{ErrorCode, Ssl, SslContext, SslStream};
use tracing::{debug, warn};

use crate::error::NetError;
use crate::sync::Mutex;

use super::provider::IoStatus;
use super::{Connection, ReadOutcome, Transport, TlsAccess};

/// Receive scratch for one wire datagram; larger than any DTLS record.
const WIRE_DATAGRAM_MAX: usize = 18 * 1024;

/// In-memory datagram transport backing the engine.
#[derive(Default)]
struct DatagramIo {
  incoming: VecDeque<Vec<u8>>,
  outgoing: VecDeque<Vec<u8>>,
}

impl Read for DatagramIo {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self.incoming.pop_front() {
      Some(datagram) => {
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
      }
      None => Err(io::ErrorKind::WouldBlock.into()),
    }
  }
}

impl Write for DatagramIo {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    // one engine write is one wire datagram
    self.outgoing.push_back(buf.to_vec());
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

struct DtlsState {
  stream: SslStream<DatagramIo>,
  read_buf: Vec<u8>,
  plain_buf: Vec<u8>,
  shutdown_sent: bool,
}

pub(crate) struct DtlsTransport {
  state: Mutex<DtlsState>,
  handshake_done: AtomicBool,
}

fn stack_err(err: ErrorStack) -> NetError {
  NetError::TlsHandshake(err.to_string())
}

impl DtlsTransport {
  fn with_ssl(ssl: Ssl) -> Result<Self, NetError> {
    let stream =
      SslStream::new(ssl, DatagramIo::default()).map_err(stack_err)?;
    Ok(Self {
      state: Mutex::new(DtlsState {
        stream,
        read_buf: vec![0u8; WIRE_DATAGRAM_MAX],
        plain_buf: vec![0u8; WIRE_DATAGRAM_MAX],
        shutdown_sent: false,
      }),
      handshake_done: AtomicBool::new(false),
    })
  }

  pub fn client(
    context: &SslContext,
    server_name: Option<&str>,
  ) -> Result<Self, NetError> {
    let mut ssl = Ssl::new(context).map_err(stack_err)?;
    ssl.set_connect_state();
    if let Some(name) = server_name {
      ssl.set_hostname(name).map_err(stack_err)?;
    }
    Self::with_ssl(ssl)
  }

  pub fn server(context: &SslContext) -> Result<Self, NetError> {
    let mut ssl = Ssl::new(context).map_err(stack_err)?;
    ssl.set_accept_state();
    Self::with_ssl(ssl)
  }

  /// Send every wire datagram the engine produced, one provider write per
  /// datagram so packet boundaries survive.
  fn flush_engine(
    &self,
    conn: &Connection,
    state: &mut DtlsState,
  ) -> Result<(), NetError> {
    while let Some(datagram) = state.stream.get_mut().outgoing.pop_front() {
      let mut write = conn.write_state();
      write.staging.extend_from_slice(&datagram);
      conn.write_to_socket(&mut *write)?;
    }
    Ok(())
  }

  /// Step the handshake; `true` when it completed.
  fn drive_handshake(
    &self,
    conn: &Connection,
    state: &mut DtlsState,
  ) -> Result<bool, NetError> {
    let result = state.stream.do_handshake();
    self.flush_engine(conn, state)?;
    match result {
      Ok(()) => Ok(true),
      Err(err)
        if err.code() == ErrorCode::WANT_READ
          || err.code() == ErrorCode::WANT_WRITE =>
      {
        Ok(false)
      }
      Err(err) => Err(NetError::TlsHandshake(err.to_string())),
    }
  }

  /// Decrypt buffered records; stops on `WANT_READ`, answers a peer
  /// close-notify.
  fn read_records(
    &self,
    conn: &Connection,
    state: &mut DtlsState,
  ) -> Result<Option<Vec<u8>>, NetError> {
    let mut out = Vec::new();
    loop {
      let DtlsState { stream, plain_buf, shutdown_sent, .. } = state;
      match stream.ssl_read(plain_buf) {
        Ok(0) => break,
        Ok(n) => out.extend_from_slice(&plain_buf[..n]),
        Err(err) if err.code() == ErrorCode::WANT_READ => break,
        Err(err) if err.code() == ErrorCode::ZERO_RETURN => {
          if !*shutdown_sent {
            *shutdown_sent = true;
            let _ = stream.shutdown();
          }
          break;
        }
        Err(err) => return Err(NetError::TlsRecord(err.to_string())),
      }
    }
    // handshake replies, retransmissions or the shutdown alert
    self.flush_engine(conn, state)?;
    Ok(if out.is_empty() { None } else { Some(out) })
  }

  fn read_inner(
    &self,
    conn: &Connection,
    state: &mut DtlsState,
  ) -> Result<ReadOutcome, NetError> {
    // pull one wire datagram from the provider into the engine
    {
      let DtlsState { stream, read_buf, .. } = &mut *state;
      match conn.provider_read(read_buf) {
        Ok(IoStatus::Ready(n)) if n > 0 => {
          stream.get_mut().incoming.push_back(read_buf[..n].to_vec());
        }
        Ok(IoStatus::Ready(_)) | Ok(IoStatus::WouldBlock) => {}
        Ok(IoStatus::Closed) => return Ok(ReadOutcome::Eof),
        Err(err) => return Err(err.into()),
      }
    }
    if !self.handshake_done.load(Ordering::Acquire) {
      if !self.drive_handshake(conn, state)? {
        return Ok(ReadOutcome::None);
      }
      self.handshake_done.store(true, Ordering::Release);
      debug!(
        peer = ?conn.apparent_remote_address(),
        cipher = ?state.stream.ssl().current_cipher().map(|c| c.name()),
        "dtls handshake completed"
      );
      let data = self.read_records(conn, state)?;
      return Ok(ReadOutcome::Connected(data));
    }
    let data = self.read_records(conn, state)?;
    Ok(match data {
      Some(data) => ReadOutcome::Data(data),
      None => ReadOutcome::None,
    })
  }
}

impl Transport for DtlsTransport {
  fn read(&self, conn: &Connection) -> Option<Vec<u8>> {
    if !conn.is_socket_connected() {
      return None;
    }
    let outcome = {
      let mut state = self.state.lock();
      self.read_inner(conn, &mut *state)
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
        // one application write is one DTLS record
        match state.stream.ssl_write(data) {
          Ok(n) if n == data.len() => {}
          Ok(_) => {
            return Err(NetError::TlsRecord(
              "engine consumed a partial datagram write".into(),
            ))
          }
          Err(err) => return Err(NetError::TlsRecord(err.to_string())),
        }
      }
      if flush {
        self.flush_engine(conn, &mut *state)?;
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
      self.flush_engine(conn, &mut *state)
    };
    if let Err(err) = result {
      conn.handle_error(err);
      return false;
    }
    conn.flush_write_backlog()
  }

  fn on_socket_connect(&self, conn: &Connection) {
    let result = {
      let mut state = self.state.lock();
      self.drive_handshake(conn, &mut *state)
    };
    match result {
      Ok(true) => {
        self.handshake_done.store(true, Ordering::Release);
        conn.handle_connect();
      }
      Ok(false) => {}
      Err(err) => conn.handle_error(err),
    }
  }

  /// Orderly close: send close-notify; failures are logged and swallowed.
  fn before_close(&self, conn: &Connection) {
    let mut state = self.state.lock();
    if !state.shutdown_sent {
      state.shutdown_sent = true;
      if let Err(err) = state.stream.shutdown() {
        if err.code() != ErrorCode::WANT_READ
          && err.code() != ErrorCode::WANT_WRITE
        {
          debug!("error while sending dtls close notify: {err}");
        }
      }
    }
    if conn.is_socket_connected() {
      if let Err(err) = self.flush_engine(conn, &mut *state) {
        warn!("error while writing dtls close notify: {err}");
      }
    }
  }

  fn is_connected(&self, conn: &Connection) -> bool {
    conn.is_socket_connected() && self.handshake_done.load(Ordering::Acquire)
  }

  fn tls(&self) -> Option<&dyn TlsAccess> {
    Some(self)
  }
}

impl TlsAccess for DtlsTransport {
  fn protocol(&self) -> Option<String> {
    let state = self.state.lock();
    Some(state.stream.ssl().version_str().to_string())
  }

  fn cipher(&self) -> Option<String> {
    let state = self.state.lock();
    state.stream.ssl().current_cipher().map(|c| c.name().to_string())
  }

  fn application_protocol(&self) -> Option<String> {
    let state = self.state.lock();
    state
      .stream
      .ssl()
      .selected_alpn_protocol()
      .map(|proto| String::from_utf8_lossy(proto).into_owned())
      .filter(|proto| !proto.is_empty())
  }
}

/// ALPN names in openssl's length-prefixed wire format, preference order
/// preserved.
pub(crate) fn alpn_wire_format(names: &[String]) -> Vec<u8> {
  let mut wire = Vec::new();
  for name in names {
    let bytes = name.as_bytes();
    debug_assert!(bytes.len() <= u8::MAX as usize);
    wire.push(bytes.len() as u8);
    wire.extend_from_slice(bytes);
  }
  wire
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn datagram_io_preserves_packet_boundaries() {
    let mut io = DatagramIo::default();
    io.write_all(b"first").unwrap();
    io.write_all(b"second-longer").unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(io.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"first");
    assert_eq!(io.read(&mut buf).unwrap(), 13);
    assert!(matches!(
      io.read(&mut buf),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock
    ));
  }

  #[test]
  fn alpn_wire_format_is_length_prefixed() {
    let wire =
      alpn_wire_format(&["h2".to_string(), "http/1.1".to_string()]);
    assert_eq!(wire, b"\x02h2\x08http/1.1".to_vec());
  }
}
