//! DTLS scenarios: handshake over the datagram demultiplexer and echo,
//! through the public builders.

mod common;

use std::time::Duration;

use common::*;

#[test]
fn dtls_handshake_and_echo() {
  let cert = generate_cert();
  let server = start_udp_server(Some(dtls_server_context(&cert)), 0, 8192);
  server.server.set_connection_callback(echo_callback());

  let manager = start_udp_manager(Some(dtls_client_context()));
  let conn = manager
    .manager
    .connection(ConnectionParameters::new(server.addr))
    .unwrap();
  let rx = wire_events(&conn);

  conn.connect(0);
  // connect fires only once the DTLS handshake completed
  assert_eq!(expect_event(&rx, Duration::from_secs(10)), Ev::Connect);
  assert!(conn.is_connected());

  let tls = conn.tls().expect("dtls accessors");
  assert!(tls.protocol().is_some());
  assert!(tls.cipher().is_some());

  conn.write(b"datagram secret");
  match expect_event(&rx, Duration::from_secs(10)) {
    Ev::Data(data) => assert_eq!(data, b"datagram secret"),
    other => panic!("unexpected event {other:?}"),
  }

  conn.close();
  manager.shutdown();
  server.shutdown();
}

/// Two DTLS clients handshake against the same server socket; the server
/// keeps the sessions apart.
#[test]
fn dtls_demultiplexes_peers() {
  let cert = generate_cert();
  let server = start_udp_server(Some(dtls_server_context(&cert)), 0, 8192);
  server.server.set_connection_callback(echo_callback());

  let manager = start_udp_manager(Some(dtls_client_context()));
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
  assert_eq!(expect_event(&rx_a, Duration::from_secs(10)), Ev::Connect);
  assert_eq!(expect_event(&rx_b, Duration::from_secs(10)), Ev::Connect);

  conn_a.write(b"from-a");
  conn_b.write(b"from-b");
  match expect_event(&rx_a, Duration::from_secs(10)) {
    Ev::Data(data) => assert_eq!(data, b"from-a"),
    other => panic!("unexpected event {other:?}"),
  }
  match expect_event(&rx_b, Duration::from_secs(10)) {
    Ev::Data(data) => assert_eq!(data, b"from-b"),
    other => panic!("unexpected event {other:?}"),
  }

  manager.shutdown();
  server.shutdown();
}
