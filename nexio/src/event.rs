//! Connection event table and worker dispatch.
//!
//! Every connection carries one handler slot per event kind. All events
//! except `error` are dispatched through the connection's worker; `error`
//! runs synchronously on the calling thread and always ends with the
//! connection being destroyed.

use std::sync::Arc;

use crate::conn::Connection;
use crate::error::NetError;

/// Identifies a connection lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
  Connect,
  Timeout,
  Data,
  Writable,
  Close,
  Error,
}

/// A unit of work scheduled onto a connection's worker.
pub type Task = Box<dyn FnOnce() + Send>;

/// Executes submitted tasks in submission order and never runs two tasks of
/// the same connection concurrently.
///
/// The default worker runs tasks synchronously on the submitting thread,
/// which for readiness-driven events is the I/O thread. Applications may
/// install a worker that offloads to another thread so expensive handlers do
/// not stall the loop.
pub type Worker = Arc<dyn Fn(Task) + Send + Sync>;

/// Produces a worker for each newly created connection.
pub type WorkerCreator = Arc<dyn Fn(&Connection) -> Worker + Send + Sync>;

/// The default worker: runs every task inline on the submitting thread.
pub fn sync_worker() -> Worker {
  Arc::new(|task: Task| task())
}

pub(crate) type Handler = Arc<dyn Fn() + Send + Sync>;
pub(crate) type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub(crate) type ErrorHandler = Arc<dyn Fn(&NetError) + Send + Sync>;

/// Per-connection handler slots, one per [`Event`].
#[derive(Default)]
pub(crate) struct EventTable {
  pub connect: Option<Handler>,
  pub timeout: Option<Handler>,
  pub data: Option<DataHandler>,
  pub writable: Option<Handler>,
  pub close: Option<Handler>,
  pub error: Option<ErrorHandler>,
  /// Fallback used when no `error` handler was registered, installed by
  /// client managers and servers for default logging.
  pub error_default: Option<ErrorHandler>,
}

impl EventTable {
  pub fn error_handler(&self) -> Option<ErrorHandler> {
    self.error.clone().or_else(|| self.error_default.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn sync_worker_runs_inline_in_order() {
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = sync_worker();
    for expected in 0..4 {
      let c = counter.clone();
      worker(Box::new(move || {
        assert_eq!(c.fetch_add(1, Ordering::SeqCst), expected);
      }));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn explicit_error_handler_wins_over_default() {
    let mut table = EventTable::default();
    assert!(table.error_handler().is_none());
    table.error_default = Some(Arc::new(|_| {}));
    assert!(table.error_handler().is_some());
    let hit = Arc::new(AtomicUsize::new(0));
    let h = hit.clone();
    table.error = Some(Arc::new(move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    }));
    (table.error_handler().unwrap())(&NetError::ConnectTimedOut);
    assert_eq!(hit.load(Ordering::SeqCst), 1);
  }
}
