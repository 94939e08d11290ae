//! TLS scenarios: handshake, echo, ALPN negotiation through the builder's
//! protocol list, and the accessor surface.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;

#[test]
fn tls_echo_and_accessors() {
  let cert = generate_cert();
  let server = start_tcp_server(Some(tls_server_config(&cert)), 0);
  server.server.set_connection_callback(echo_callback());

  let manager = start_tcp_manager(Some(tls_client_config()));
  let conn = manager
    .manager
    .connection(
      ConnectionParameters::new(server.addr)
        .with_server_names(vec!["localhost".into()]),
    )
    .unwrap();
  let rx = wire_events(&conn);

  assert!(!conn.is_connected());
  conn.connect(3000);
  assert_eq!(expect_event(&rx, Duration::from_secs(10)), Ev::Connect);
  // connect fires only after the handshake
  assert!(conn.is_connected());
  assert!(conn.is_socket_connected());

  let tls = conn.tls().expect("tls accessors on an encrypted connection");
  let protocol = tls.protocol().expect("negotiated protocol");
  assert!(protocol.starts_with("TLSv1."), "unexpected protocol {protocol}");
  assert!(tls.cipher().is_some());
  assert_eq!(tls.application_protocol(), None);

  conn.write(b"over tls");
  let (data, _) = collect_data(&rx, 8, Duration::from_secs(10));
  assert_eq!(data, b"over tls");

  conn.close();
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

#[test]
fn tls_alpn_negotiation_matches_on_both_sides() {
  let cert = generate_cert();
  let server = start_server(
    ServerBuilder::new()
      .bind_addresses(vec![LOCALHOST])
      .ports(vec![free_tcp_port()])
      .tls_config(ServerTlsConfig::Stream(tls_server_config(&cert)))
      .application_layer_protocols(vec!["h2".into(), "http/1.1".into()]),
  );

  let negotiated_on_server = Arc::new(Mutex::new(None::<String>));
  let seen = negotiated_on_server.clone();
  server.server.set_connection_callback(Arc::new(move |conn| {
    *seen.lock().unwrap() =
      conn.tls().and_then(|tls| tls.application_protocol());
    let echo = conn.clone();
    conn.on_data(move |data| echo.write(data));
  }));

  let client_alpn = vec!["http/1.1".to_string(), "h2".to_string()];
  let manager = start_tcp_manager(Some(tls_client_config()));
  let conn = manager
    .manager
    .connection(
      ConnectionParameters::new(server.addr)
        .with_server_names(vec!["localhost".into()])
        .with_alpn_names(client_alpn.clone()),
    )
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(3000);
  assert_eq!(expect_event(&rx, Duration::from_secs(10)), Ev::Connect);

  let client_proto = conn
    .tls()
    .and_then(|tls| tls.application_protocol())
    .expect("alpn negotiated");
  assert!(client_alpn.contains(&client_proto));

  // one echo round trip guarantees the server callback ran
  conn.write(b"alpn");
  let (data, _) = collect_data(&rx, 4, Duration::from_secs(10));
  assert_eq!(data, b"alpn");
  assert_eq!(
    negotiated_on_server.lock().unwrap().as_deref(),
    Some(client_proto.as_str())
  );

  manager.shutdown();
  server.shutdown();
}

#[test]
fn tls_large_transfer_round_trips() {
  const TOTAL: usize = 256 * 1024;

  let cert = generate_cert();
  let server = start_tcp_server(Some(tls_server_config(&cert)), 0);
  server.server.set_connection_callback(echo_callback());

  let manager = start_tcp_manager(Some(tls_client_config()));
  let conn = manager
    .manager
    .connection(
      ConnectionParameters::new(server.addr)
        .with_server_names(vec!["localhost".into()]),
    )
    .unwrap();
  let rx = wire_events(&conn);
  conn.connect(3000);
  assert_eq!(expect_event(&rx, Duration::from_secs(10)), Ev::Connect);

  let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
  conn.write(&payload);
  let (data, _) = collect_data(&rx, TOTAL, Duration::from_secs(30));
  assert_eq!(data, payload);

  manager.shutdown();
  server.shutdown();
}
