//! The readiness loop: multiplexes many sockets on one thread, accepts
//! channel registrations from other threads, and rebuilds itself when the
//! platform selection call keeps returning without ready keys.

pub(crate) mod key;
pub(crate) mod poller;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{error, trace, warn};

use crate::config;
use crate::conn::Connection;
use crate::error::NetError;
use crate::sync::{Mutex, RwLock};

use key::SelectionKey;
use poller::{Events, Poller, Ready};

/// Handler half of a readiness loop: a server or client manager implements
/// this and passes itself to [`Selector::run_loop`].
pub(crate) trait SelectorTarget: Sync {
  /// Runs at the top of every loop turn, even on zero-key wakeups.
  fn loop_iteration(&self) -> Result<(), NetError> {
    Ok(())
  }

  /// Handles one selected key; invoked under the key's lock.
  fn handle_key(
    &self,
    key: &Arc<SelectionKey>,
    ready: Ready,
  ) -> Result<(), NetError>;
}

struct TimerEntry {
  deadline: Instant,
  seq: u64,
  cancelled: Arc<AtomicBool>,
  task: Box<dyn FnOnce() + Send>,
}

impl PartialEq for TimerEntry {
  fn eq(&self, other: &Self) -> bool {
    self.deadline == other.deadline && self.seq == other.seq
  }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Ord for TimerEntry {
  // reversed so the BinaryHeap pops the earliest deadline first
  fn cmp(&self, other: &Self) -> CmpOrdering {
    other
      .deadline
      .cmp(&self.deadline)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

/// Cancellation handle for a scheduled one-shot task.
pub(crate) struct TimerHandle {
  cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
  }
}

/// Owns the readiness primitive and the registered-channel set.
pub(crate) struct Selector {
  poller: RwLock<Poller>,
  registry: Mutex<HashMap<u64, Arc<SelectionKey>>>,
  next_token: AtomicU64,
  running: AtomicBool,
  register_pending: AtomicBool,
  timers: Mutex<BinaryHeap<TimerEntry>>,
  timer_seq: AtomicU64,
  /// Upper bound on how long a select may block, so periodic work in
  /// `loop_iteration` (idle-timeout sweeps) runs even on a quiet loop.
  tick_interval: Mutex<Option<Duration>>,
}

impl Selector {
  pub fn new() -> io::Result<Arc<Self>> {
    Ok(Arc::new(Self {
      poller: RwLock::new(Poller::new()?),
      registry: Mutex::new(HashMap::new()),
      next_token: AtomicU64::new(0),
      running: AtomicBool::new(true),
      register_pending: AtomicBool::new(false),
      timers: Mutex::new(BinaryHeap::new()),
      timer_seq: AtomicU64::new(0),
      tick_interval: Mutex::new(None),
    }))
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Force a blocking select to return.
  pub fn wakeup(&self) {
    let _ = self.poller.read().notify();
  }

  pub fn set_tick_interval(&self, interval: Option<Duration>) {
    *self.tick_interval.lock() = interval;
  }

  /// Schedule a one-shot task to run on the I/O thread after `delay`.
  pub fn schedule(
    &self,
    delay: Duration,
    task: impl FnOnce() + Send + 'static,
  ) -> TimerHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let entry = TimerEntry {
      deadline: Instant::now() + delay,
      seq: self.timer_seq.fetch_add(1, Ordering::Relaxed),
      cancelled: cancelled.clone(),
      task: Box::new(task),
    };
    self.timers.lock().push(entry);
    self.wakeup();
    TimerHandle { cancelled }
  }

  fn next_timeout(&self) -> Option<Duration> {
    let timer = self.timers.lock().peek().map(|entry| {
      entry.deadline.saturating_duration_since(Instant::now())
    });
    let tick = *self.tick_interval.lock();
    match (timer, tick) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (Some(a), None) => Some(a),
      (None, tick) => tick,
    }
  }

  fn run_due_timers(&self) -> usize {
    let now = Instant::now();
    let mut due = Vec::new();
    {
      let mut timers = self.timers.lock();
      while let Some(entry) = timers.peek() {
        if entry.deadline > now {
          break;
        }
        due.push(timers.pop().unwrap());
      }
    }
    let mut fired = 0;
    for entry in due {
      if !entry.cancelled.load(Ordering::Acquire) {
        (entry.task)();
      }
      fired += 1;
    }
    fired
  }

  /// Register a channel with this selector. Safe to call from any thread
  /// while another thread blocks in the selection operation: the
  /// `register_pending` flag plus a wakeup keep the loop from re-entering
  /// select while the registration is in flight.
  pub fn register_channel(
    self: &Arc<Self>,
    fd: RawFd,
    ops: u8,
  ) -> io::Result<Arc<SelectionKey>> {
    if !self.is_running() {
      return Err(io::Error::new(
        io::ErrorKind::NotConnected,
        "selector is closed",
      ));
    }
    self.register_pending.store(true, Ordering::Release);
    self.wakeup();
    let result = (|| {
      let token = self.next_token.fetch_add(1, Ordering::Relaxed);
      let key = Arc::new(SelectionKey::new(
        token,
        fd,
        Arc::downgrade(self),
        ops,
      ));
      let mut registry = self.registry.lock();
      self.poller.read().add(fd, token, ops)?;
      registry.insert(token, key.clone());
      Ok(key)
    })();
    self.register_pending.store(false, Ordering::Release);
    result
  }

  pub(crate) fn deregister(&self, token: u64, fd: RawFd) {
    self.registry.lock().remove(&token);
    let _ = self.poller.read().delete(fd);
  }

  pub(crate) fn poller_modify(
    &self,
    fd: RawFd,
    token: u64,
    ops: u8,
  ) -> io::Result<()> {
    self.poller.read().modify(fd, token, ops)
  }

  /// Stop the loop and destroy every registered channel. Idempotent; may be
  /// called from any thread.
  pub fn close(&self) {
    if !self.running.swap(false, Ordering::AcqRel) {
      return;
    }
    self.wakeup();
    let keys: Vec<Arc<SelectionKey>> =
      self.registry.lock().values().cloned().collect();
    for key in keys {
      match key.attached_connection() {
        Some(conn) => conn.destroy(),
        None => key.cancel(),
      }
    }
  }

  fn wait_register_pending(&self) -> Result<(), NetError> {
    if !self.register_pending.load(Ordering::Acquire) {
      return Ok(());
    }
    let start = Instant::now();
    while self.register_pending.load(Ordering::Acquire) {
      std::hint::spin_loop();
      if start.elapsed() > Duration::from_secs(2) {
        return Err(NetError::RegisterTimeout);
      }
    }
    Ok(())
  }

  /// A rebuild opens a fresh readiness primitive, re-registers each
  /// still-valid channel with its interest set, and drops the old primitive.
  /// On the final attempt, affected channels are destroyed instead.
  fn rebuild(&self, destroy: bool) {
    let new_poller = match Poller::new() {
      Ok(p) => p,
      Err(err) => {
        error!("error while rebuilding selector: {err}");
        return;
      }
    };
    let doomed: Vec<Arc<SelectionKey>> = {
      // registry stays locked across the swap so registrations serialize
      // with the rebuild; key locks are not taken here (a concurrently
      // closing key simply fails its re-registration)
      let registry = self.registry.lock();
      if !destroy {
        for key in registry.values() {
          if !key.is_valid() {
            continue;
          }
          if let Err(err) =
            new_poller.add(key.fd(), key.token(), key.interest())
          {
            warn!(fd = key.fd(), "failed to re-register channel: {err}");
          }
        }
      }
      let doomed = if destroy {
        registry.values().cloned().collect()
      } else {
        Vec::new()
      };
      *self.poller.write() = new_poller;
      doomed
    };
    for key in doomed {
      match key.attached_connection() {
        Some(conn) => conn.destroy(),
        None => key.cancel(),
      }
    }
  }

  /// Run the selection loop until [`close`](Self::close) is called.
  pub fn run_loop(
    &self,
    target: &dyn SelectorTarget,
  ) -> Result<(), NetError> {
    let mut events = Events::with_capacity(1024);
    let mut selector_spins: usize = 0;
    let mut selector_rebuilds: usize = 0;

    while self.is_running() {
      target.loop_iteration()?;
      // loop_iteration may run callbacks that close this selector; do not
      // select on a closed one
      if !self.is_running() {
        break;
      }

      let timeout = self.next_timeout();
      let started = Instant::now();
      {
        let poller = self.poller.read();
        poller.wait(&mut events, timeout)?;
      }
      let timers_fired = self.run_due_timers();

      let mut handled = 0usize;
      for (token, ready) in events.iter() {
        let key = self.registry.lock().get(&token).cloned();
        let Some(key) = key else { continue };
        {
          let _guard = key.lock();
          if key.is_valid() {
            target.handle_key(&key, ready)?;
          }
        }
        handled += 1;
      }

      let full_timeout_elapsed = match timeout {
        Some(t) => started.elapsed() + Duration::from_millis(2) >= t,
        None => false,
      };
      if handled > 0 {
        selector_spins = 0;
        selector_rebuilds = 0;
      } else if timers_fired > 0 || full_timeout_elapsed {
        // an expired timeout is not a spurious wakeup
        selector_spins = 0;
      } else {
        selector_spins += 1;
      }

      self.wait_register_pending()?;

      if selector_spins >= config::selector_rebuild_threshold() {
        selector_rebuilds += 1;
        if selector_rebuilds > config::selector_max_rebuilds() {
          return Err(NetError::RebuildLimit(selector_rebuilds));
        }
        let destroy = selector_rebuilds == config::selector_max_rebuilds();
        warn!(
          spins = selector_spins,
          rebuild = selector_rebuilds,
          destroy,
          "selection returned prematurely too many times in a row, \
           rebuilding selector"
        );
        self.rebuild(destroy);
        selector_spins = 0;
      }
    }
    Ok(())
  }
}

/// Selector with local-close bookkeeping.
///
/// When a channel is closed via its own close syscall, its key disappears
/// from the selector before the next select returns, so no readiness event
/// will ever signal the close. Locally initiated closes are funneled through
/// this queue instead and dispatched on the I/O thread, preserving the
/// single-writer property of event dispatch.
pub(crate) struct ConnectionSelector {
  selector: Arc<Selector>,
  closed_connections: SegQueue<Connection>,
}

impl ConnectionSelector {
  pub fn new() -> io::Result<Arc<Self>> {
    Ok(Arc::new(Self {
      selector: Selector::new()?,
      closed_connections: SegQueue::new(),
    }))
  }

  pub fn selector(&self) -> &Arc<Selector> {
    &self.selector
  }

  /// Notify that a connection was closed locally. Callable from any thread.
  pub fn connection_closed(&self, conn: Connection) {
    self.closed_connections.push(conn);
    self.selector.wakeup();
  }

  /// Drain the local-close queue, invoking `handle` for each connection
  /// under its selection-key lock. Called at the top of each loop turn.
  pub fn drain_closed(&self, mut handle: impl FnMut(&Connection)) {
    while let Some(conn) = self.closed_connections.pop() {
      trace!("handling local close");
      let _guard = conn.key().lock();
      handle(&conn);
    }
  }
}
