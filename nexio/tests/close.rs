//! Graceful versus forced close semantics over builder-constructed
//! endpoints.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;

/// A graceful close drains the write backlog first: the peer receives the
/// whole payload even though close() was called while most of it was still
/// pending.
#[test]
fn graceful_close_delivers_pending_bytes() {
  const TOTAL: usize = 1 << 20;

  let server = start_tcp_server(None, 0);
  server.server.set_connection_callback(Arc::new(|conn| {
    let payload = vec![b'X'; TOTAL];
    conn.write(&payload);
    conn.close();
  }));

  let manager = start_tcp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(1000);
  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);

  let (data, _) = collect_data(&rx, TOTAL, Duration::from_secs(20));
  assert_eq!(data.len(), TOTAL);
  assert!(data.iter().all(|b| *b == b'X'));

  // after the payload, the close arrives
  let mut saw_close = false;
  while let Ok(ev) = rx.recv_timeout(Duration::from_secs(5)) {
    if ev == Ev::Close {
      saw_close = true;
      break;
    }
  }
  assert!(saw_close);

  manager.shutdown();
  server.shutdown();
}

/// A forced close tears the transport down promptly; the peer sees EOF.
#[test]
fn destroy_closes_promptly() {
  let server = start_tcp_server(None, 0);
  server.server.set_connection_callback(Arc::new(|conn| {
    let victim = conn.clone();
    conn.on_data(move |_| victim.destroy());
  }));

  let manager = start_tcp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(1000);
  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);

  conn.write(b"x");
  let mut saw_close = false;
  while let Ok(ev) = rx.recv_timeout(Duration::from_secs(5)) {
    if ev == Ev::Close {
      saw_close = true;
      break;
    }
  }
  assert!(saw_close, "peer destroy surfaces as a prompt close");

  manager.shutdown();
  server.shutdown();
}

/// destroy() is idempotent and close-after-destroy stays silent.
#[test]
fn destroy_is_idempotent() {
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

  conn.destroy();
  conn.destroy();
  conn.close();

  let mut closes = 0;
  while let Ok(ev) = rx.recv_timeout(Duration::from_secs(2)) {
    if ev == Ev::Close {
      closes += 1;
    }
  }
  assert_eq!(closes, 1, "close fires exactly once");

  manager.shutdown();
  server.shutdown();
}
