//! Plain TCP scenarios: echo round trips, pre-connect writes and zero-byte
//! writes, built and connected through the public builders.

mod common;

use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::*;

#[test]
fn plain_tcp_echo() {
  let server = start_tcp_server(None, 0);
  server.server.set_connection_callback(echo_callback());

  let manager = start_tcp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(1000);

  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);
  assert!(conn.is_connected());
  assert!(conn.is_writable());

  conn.write(b"hello");
  conn.write(b"world");
  let (data, other) = collect_data(&rx, 10, Duration::from_secs(5));
  assert_eq!(data, b"helloworld");
  assert!(
    !other.contains(&Ev::Close),
    "no close expected while the connection is live"
  );

  conn.close();
  let mut saw_close = false;
  while let Ok(ev) = rx.recv_timeout(Duration::from_secs(5)) {
    if ev == Ev::Close {
      saw_close = true;
      break;
    }
  }
  assert!(saw_close, "close event after local close");

  manager.shutdown();
  server.shutdown();
}

#[test]
fn pre_connect_writes_flush_in_order() {
  let server = start_tcp_server(None, 0);
  let (received_tx, received_rx) = mpsc::channel::<Vec<u8>>();
  server.server.set_connection_callback(Arc::new(move |conn| {
    let tx = received_tx.clone();
    conn.on_data(move |data| {
      let _ = tx.send(data.to_vec());
    });
  }));

  let manager = start_tcp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);

  // issued before connect: queued, then flushed in order on connect
  conn.write(b"A");
  conn.write(b"B");
  assert!(!conn.has_connected());
  conn.connect(1000);

  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);
  assert!(conn.has_connected());

  let mut received = Vec::new();
  while received.len() < 2 {
    received
      .extend(received_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  }
  assert_eq!(received, b"AB");

  manager.shutdown();
  server.shutdown();
}

#[test]
fn zero_byte_writes_are_silent() {
  let server = start_tcp_server(None, 0);
  server.server.set_connection_callback(echo_callback());

  let manager = start_tcp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(1000);
  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);

  conn.write(b"");
  conn.flush();
  // a zero-byte write produces no wire bytes, so the echo of the probe is
  // the only data that ever arrives
  conn.write(b"probe");
  let (data, _) = collect_data(&rx, 5, Duration::from_secs(5));
  assert_eq!(data, b"probe");

  manager.shutdown();
  server.shutdown();
}
