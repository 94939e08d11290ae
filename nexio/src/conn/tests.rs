//! Focused tests of the base write machinery over a socketpair: staging
//! chunking, backlog spill and drain, and the writable transition. These
//! reach into connection internals; the black-box protocol scenarios live
//! in the crate-level `tests/` directory.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use crate::selector::key::Attachment;
use crate::selector::Selector;

use super::plain::PlainTransport;
use super::provider::StreamProvider;
use super::Connection;

fn make_nonblocking(fd: RawFd) {
  let flags = syscall!(fcntl(fd, libc::F_GETFL)).unwrap();
  syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).unwrap();
}

/// A connected plaintext connection over one end of a socketpair; the other
/// end is returned raw for direct reads.
fn socketpair_conn() -> (Connection, OwnedFd, Arc<Selector>) {
  let mut fds = [0i32; 2];
  syscall!(socketpair(
    libc::AF_UNIX,
    libc::SOCK_STREAM,
    0,
    fds.as_mut_ptr()
  ))
  .unwrap();
  make_nonblocking(fds[0]);
  make_nonblocking(fds[1]);

  let selector = Selector::new().unwrap();
  let key = selector.register_channel(fds[0], 0).unwrap();
  let sock = unsafe { socket2::Socket::from_raw_fd(fds[0]) };
  let provider = StreamProvider::new(sock, key.clone());
  let conn = Connection::create(
    key.clone(),
    Box::new(provider),
    Box::new(PlainTransport::new()),
    None,
    None,
  );
  key.attach(Attachment::Conn(conn.clone()));
  // dispatch connect so writes go to the socket instead of the queue
  conn.handle_connect();
  assert!(conn.has_connected());

  let peer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
  (conn, peer, selector)
}

fn read_available(fd: RawFd, into: &mut Vec<u8>) {
  let mut buf = [0u8; 65536];
  loop {
    match syscall!(read(
      fd,
      buf.as_mut_ptr() as *mut libc::c_void,
      buf.len()
    )) {
      Ok(n) if n > 0 => into.extend_from_slice(&buf[..n as usize]),
      _ => break,
    }
  }
}

#[test]
fn oversized_write_spills_to_backlog_and_drains() {
  let (conn, peer, _selector) = socketpair_conn();
  let writable_seen = Arc::new(AtomicBool::new(false));
  let seen = writable_seen.clone();
  conn.on_writable(move || {
    seen.store(true, Ordering::SeqCst);
  });

  // far larger than the kernel socket buffer: the tail must spill
  let payload: Vec<u8> = (0..(1 << 20)).map(|i| (i % 251) as u8).collect();
  conn.write(&payload);
  assert!(!conn.is_writable(), "kernel cannot have taken 1 MiB at once");

  let mut received = Vec::new();
  let mut drained = false;
  for _ in 0..10_000 {
    read_available(peer.as_raw_fd(), &mut received);
    if !drained {
      drained = conn.flush_write_backlog();
    }
    if received.len() == payload.len() {
      break;
    }
  }
  assert_eq!(received.len(), payload.len());
  assert_eq!(received, payload);
  assert!(drained);
  assert!(conn.is_writable());
  assert!(
    writable_seen.load(Ordering::SeqCst),
    "writable fires on the backlog non-empty to empty transition"
  );
}

#[test]
fn write_larger_than_staging_is_lossless() {
  let (conn, peer, _selector) = socketpair_conn();
  // several staging buffers worth, but below the kernel buffer size
  let payload: Vec<u8> = (0..50_000).map(|i| (i % 239) as u8).collect();
  conn.write(&payload);
  assert!(conn.is_writable());

  let mut received = Vec::new();
  read_available(peer.as_raw_fd(), &mut received);
  assert_eq!(received, payload);
}

#[test]
fn close_with_pending_backlog_destroys_after_drain() {
  let (conn, peer, _selector) = socketpair_conn();
  let payload = vec![b'Q'; 1 << 20];
  conn.write(&payload);
  assert!(!conn.is_writable());

  conn.close();
  // still open: bytes are pending
  let mut received = Vec::new();
  let mut drained = false;
  for _ in 0..10_000 {
    read_available(peer.as_raw_fd(), &mut received);
    if !drained {
      drained = conn.flush_write_backlog();
    }
    if received.len() == payload.len() {
      break;
    }
  }
  assert_eq!(received.len(), payload.len());
  // the pending close ran once the backlog emptied
  assert!(drained);
  assert!(!conn.is_socket_connected());
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(16))]

  /// Interleaved write/write_queue calls deliver exactly the concatenation
  /// of all chunks, in order.
  #[test]
  fn interleaved_writes_preserve_byte_order(
    chunks in proptest::collection::vec(
      proptest::collection::vec(any::<u8>(), 0..1500),
      0..12,
    )
  ) {
    let (conn, peer, _selector) = socketpair_conn();
    let mut expected = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
      if i % 2 == 0 {
        conn.write(chunk);
      } else {
        conn.write_queue(chunk);
      }
      expected.extend_from_slice(chunk);
    }
    prop_assert!(conn.flush());

    let mut received = Vec::new();
    read_available(peer.as_raw_fd(), &mut received);
    prop_assert_eq!(received, expected);
  }
}
