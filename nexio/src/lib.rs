//! # nexio - Event-Driven Network I/O
//!
//! nexio is a callback-based abstraction over TCP and UDP sockets with
//! transparent TLS/DTLS encryption. It exposes a small set of primitives -
//! a [`Connection`] carrying bidirectional byte streams with lifecycle
//! events, a [`NetServer`](server::NetServer) accepting such connections on
//! bound local endpoints, and a
//! [`NetClientManager`](client::NetClientManager) initiating them - while
//! hiding the non-blocking readiness loop, buffer management, TLS record
//! framing and backpressure handling beneath.
//!
//! A single I/O thread drives each readiness loop. User-visible callbacks
//! (all except `error`) run on a per-connection worker; the default worker
//! runs them synchronously on the I/O thread, and applications may install
//! one that offloads to another thread.
//!
//! ### Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nexio::server::{NetServer, NetworkApplication, ServerBuilder};
//!
//! fn main() -> Result<(), nexio::NetError> {
//!     let server = ServerBuilder::new()
//!         .ports(vec![17000])
//!         .build()?;
//!     server.set_connection_callback(Arc::new(|conn| {
//!         let echo = conn.clone();
//!         conn.on_data(move |data| echo.write(data));
//!     }));
//!     server.init()?;
//!     // blocks; call server.close() from another thread to stop
//!     server.start()
//! }
//! ```

#[macro_use]
mod macros;

mod config;
mod error;
mod event;
mod sync;

pub(crate) mod selector;

pub mod client;
pub mod conn;
pub mod server;

pub use config::{
  selector_max_rebuilds, selector_rebuild_threshold, tls_disable_weak_ciphers,
  tls_min_version,
};
pub use conn::tls::{
  build_client_config, build_server_config, crypto_provider,
  enabled_protocol_versions,
};
pub use conn::{Connection, TlsAccess};
pub use error::NetError;
pub use event::{sync_worker, Event, Task, Worker, WorkerCreator};
