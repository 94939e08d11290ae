//! Synchronization primitives used throughout the crate.
//!
//! Everything here comes from `parking_lot`: locks are never poisoned, and
//! the selection-key lock must be reentrant because a key handler may close
//! its own provider, which acquires the same key lock again.

pub(crate) use parking_lot::{Mutex, ReentrantMutex, RwLock};
