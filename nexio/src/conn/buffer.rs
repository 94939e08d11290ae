//! Growable wire-byte queue used by the TLS record path.

use crate::error::NetError;

/// Contiguous byte queue with a filled prefix and spare tail.
///
/// Grows geometrically on demand up to a hard maximum; exhausting the
/// maximum is a buffer-overflow error surfaced to the connection.
pub(crate) struct ByteQueue {
  inner: Vec<u8>,
  used: usize,
  max: usize,
  what: &'static str,
}

impl ByteQueue {
  pub fn new(initial: usize, max: usize, what: &'static str) -> Self {
    debug_assert!(initial <= max);
    Self { inner: vec![0; initial], used: 0, max, what }
  }

  pub fn is_empty(&self) -> bool {
    self.used == 0
  }

  pub fn filled(&self) -> &[u8] {
    &self.inner[..self.used]
  }

  pub fn advance(&mut self, n: usize) {
    self.used += n;
    debug_assert!(self.used <= self.inner.len());
  }

  /// Drop `n` consumed bytes from the front.
  pub fn discard(&mut self, n: usize) {
    if n == 0 {
      return;
    }
    debug_assert!(n <= self.used);
    self.inner.copy_within(n..self.used, 0);
    self.used -= n;
  }

  /// Spare tail of at least `min` bytes, doubling the capacity as needed.
  pub fn spare(&mut self, min: usize) -> Result<&mut [u8], NetError> {
    while self.inner.len() - self.used < min {
      if self.inner.len() >= self.max {
        return Err(NetError::BufferOverflow(self.what));
      }
      let new_len = (self.inner.len() * 2).min(self.max);
      self.inner.resize(new_len, 0);
    }
    Ok(&mut self.inner[self.used..])
  }
}
