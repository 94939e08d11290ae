//! Error types surfaced through the `error` connection event and by the
//! selector loop.

use thiserror::Error;

/// Errors produced by connections, servers, client managers and the
/// readiness loop.
///
/// Connection-level errors are delivered through the `error` event and are
/// always followed by the connection being destroyed; they never leave the
/// library as return values of the event-driven paths. Loop-level errors
/// (`RebuildLimit`, `RegisterTimeout`, `InvalidKeyState`) abort the loop.
#[derive(Debug, Error)]
pub enum NetError {
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("tls handshake failed: {0}")]
  TlsHandshake(String),

  #[error("tls record processing failed: {0}")]
  TlsRecord(String),

  #[error("socket disconnected before the handshake completed")]
  HandshakeEof,

  #[error("buffer overflow: {0}")]
  BufferOverflow(&'static str),

  #[error("connect timed out")]
  ConnectTimedOut,

  #[error("unsupported operation: {0}")]
  Unsupported(&'static str),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("selector rebuilt too many times in a row: {0}")]
  RebuildLimit(usize),

  #[error("waiting time for register operation exceeded")]
  RegisterTimeout,

  #[error("invalid selection key readiness state")]
  InvalidKeyState,

  #[error("event handler panicked: {0}")]
  HandlerPanic(String),
}

impl NetError {
  /// True for failures of the TLS/DTLS handshake itself, which servers log
  /// quieter than other socket errors (typically the client misbehaves).
  pub fn is_handshake_failure(&self) -> bool {
    matches!(self, NetError::TlsHandshake(_) | NetError::HandshakeEof)
  }
}
