//! UDP scenarios: datagram echo and per-peer demultiplexing through the
//! public builders.

mod common;

use std::time::Duration;

use common::*;

#[test]
fn udp_echo_round_trip() {
  let server = start_udp_server(None, 0, 8192);
  server.server.set_connection_callback(echo_callback());

  let manager = start_udp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(0);

  // datagram connect completes synchronously
  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);

  conn.write(b"ping");
  match expect_event(&rx, Duration::from_secs(5)) {
    Ev::Data(data) => assert_eq!(data, b"ping"),
    other => panic!("unexpected event {other:?}"),
  }

  conn.close();
  manager.shutdown();
  server.shutdown();
}

/// Two clients on one server socket: each peer's bytes stay on its own
/// synthesized connection.
#[test]
fn udp_demultiplexes_peers() {
  let server = start_udp_server(None, 0, 8192);
  server.server.set_connection_callback(echo_callback());

  let manager = start_udp_manager(None);
  let conn_a = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let conn_b = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx_a = wire_events(&conn_a);
  let rx_b = wire_events(&conn_b);
  conn_a.connect(0);
  conn_b.connect(0);
  assert_eq!(expect_event(&rx_a, Duration::from_secs(5)), Ev::Connect);
  assert_eq!(expect_event(&rx_b, Duration::from_secs(5)), Ev::Connect);

  for round in 0..3 {
    let payload_a = format!("alpha-{round}").into_bytes();
    let payload_b = format!("beta-{round}").into_bytes();
    conn_a.write(&payload_a);
    conn_b.write(&payload_b);

    match expect_event(&rx_a, Duration::from_secs(5)) {
      Ev::Data(data) => assert_eq!(data, payload_a),
      other => panic!("unexpected event {other:?}"),
    }
    match expect_event(&rx_b, Duration::from_secs(5)) {
      Ev::Data(data) => assert_eq!(data, payload_b),
      other => panic!("unexpected event {other:?}"),
    }
  }

  manager.shutdown();
  server.shutdown();
}

/// An oversized datagram is dropped by the server rather than delivered
/// truncated.
#[test]
fn udp_oversized_datagram_is_dropped() {
  let server = start_udp_server(None, 0, 512);
  server.server.set_connection_callback(echo_callback());

  let manager = start_udp_manager(None);
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(0);
  assert_eq!(expect_event(&rx, Duration::from_secs(5)), Ev::Connect);

  // larger than the server's receive buffer: dropped, no echo
  conn.write(&vec![b'O'; 1024]);
  // a fitting datagram still round-trips afterwards
  conn.write(b"fits");
  match expect_event(&rx, Duration::from_secs(5)) {
    Ev::Data(data) => assert_eq!(data, b"fits"),
    other => panic!("unexpected event {other:?}"),
  }

  manager.shutdown();
  server.shutdown();
}
