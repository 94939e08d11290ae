//! Plaintext connections: trivial read/write directly through the provider.

use crate::error::NetError;
use crate::sync::Mutex;

use super::provider::IoStatus;
use super::{Connection, Transport, WriteState, PLAIN_BUF_SIZE};

pub(crate) struct PlainTransport {
  read_buf: Mutex<Vec<u8>>,
}

impl PlainTransport {
  pub fn new() -> Self {
    Self { read_buf: Mutex::new(vec![0u8; PLAIN_BUF_SIZE]) }
  }
}

/// Copy `data` through the staging buffer in capacity-sized chunks, writing
/// each chunk out. With `flush` unset, bytes that fit are only staged.
pub(crate) fn write_chunked(
  conn: &Connection,
  write: &mut WriteState,
  data: &[u8],
  flush: bool,
) -> Result<(), NetError> {
  if !flush && write.staging.len() + data.len() <= write.staging_cap {
    write.staging.extend_from_slice(data);
    return Ok(());
  }
  if !data.is_empty() {
    let mut written = 0usize;
    while written < data.len() {
      let room = write.staging_cap.saturating_sub(write.staging.len()).max(1);
      let take = room.min(data.len() - written);
      write.staging.extend_from_slice(&data[written..written + take]);
      conn.write_to_socket(write)?;
      written += take;
    }
  } else if flush && !write.staging.is_empty() {
    conn.write_to_socket(write)?;
  }
  Ok(())
}

impl Transport for PlainTransport {
  fn read(&self, conn: &Connection) -> Option<Vec<u8>> {
    if !conn.is_socket_connected() {
      return None;
    }
    let mut buf = self.read_buf.lock();
    match conn.provider_read(&mut buf) {
      Ok(IoStatus::Ready(n)) if n > 0 => Some(buf[..n].to_vec()),
      Ok(IoStatus::Ready(_)) | Ok(IoStatus::WouldBlock) => None,
      Ok(IoStatus::Closed) => {
        drop(buf);
        conn.destroy();
        None
      }
      Err(err) => {
        drop(buf);
        conn.handle_error(err.into());
        None
      }
    }
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
    let result = {
      let mut write = conn.write_state();
      write_chunked(conn, &mut *write, data, flush)
    };
    if let Err(err) = result {
      conn.handle_error(err);
    }
  }

  fn flush(&self, conn: &Connection) -> bool {
    self.write_buffered(conn, &[], true, false);
    conn.flush_write_backlog()
  }

  fn on_socket_connect(&self, conn: &Connection) {
    conn.handle_connect();
  }

  fn is_connected(&self, conn: &Connection) -> bool {
    conn.is_socket_connected()
  }
}
