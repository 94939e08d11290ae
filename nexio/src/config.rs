//! Process-level tunables and time helpers.
//!
//! Tunables are read from the environment once, on first use:
//!
//! - `NEXIO_SELECTOR_REBUILD_THRESHOLD` (default 1024) - the number of times
//!   the selection operation may return in a row without any selected keys
//!   before the selector is rebuilt. This mitigates platform bugs where the
//!   readiness call returns immediately without any ready keys.
//! - `NEXIO_SELECTOR_MAX_REBUILDS` (default 8) - the number of times the
//!   selector may be rebuilt in a row. Exceeding this fails the loop.
//! - `NEXIO_TLS_MIN_VERSION` (default 2) - minimum enabled TLS minor
//!   version; 2 enables TLS 1.2 and newer.
//! - `NEXIO_TLS_DISABLE_WEAK_CIPHERS` (default false) - drop cipher suites
//!   from a fixed list of families considered weak.

use std::sync::OnceLock;
use std::time::Instant;

fn parse_usize(value: Option<String>, default: usize) -> usize {
  value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_u32(value: Option<String>, default: u32) -> u32 {
  value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
  match value.as_deref().map(str::trim) {
    Some("1") | Some("true") => true,
    Some("0") | Some("false") => false,
    _ => default,
  }
}

pub fn selector_rebuild_threshold() -> usize {
  static V: OnceLock<usize> = OnceLock::new();
  *V.get_or_init(|| {
    parse_usize(std::env::var("NEXIO_SELECTOR_REBUILD_THRESHOLD").ok(), 1024)
  })
}

pub fn selector_max_rebuilds() -> usize {
  static V: OnceLock<usize> = OnceLock::new();
  *V.get_or_init(|| {
    parse_usize(std::env::var("NEXIO_SELECTOR_MAX_REBUILDS").ok(), 8)
  })
}

pub fn tls_min_version() -> u32 {
  static V: OnceLock<u32> = OnceLock::new();
  *V.get_or_init(|| parse_u32(std::env::var("NEXIO_TLS_MIN_VERSION").ok(), 2))
}

pub fn tls_disable_weak_ciphers() -> bool {
  static V: OnceLock<bool> = OnceLock::new();
  *V.get_or_init(|| {
    parse_bool(std::env::var("NEXIO_TLS_DISABLE_WEAK_CIPHERS").ok(), false)
  })
}

/// Milliseconds since an arbitrary process-local epoch.
///
/// Backed by a monotonic clock so idle-timeout deltas are immune to wall
/// clock adjustments.
pub fn now_millis() -> u64 {
  static EPOCH: OnceLock<Instant> = OnceLock::new();
  EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_numbers_with_default() {
    assert_eq!(parse_usize(None, 1024), 1024);
    assert_eq!(parse_usize(Some("64".into()), 1024), 64);
    assert_eq!(parse_usize(Some(" 8 ".into()), 1024), 8);
    assert_eq!(parse_usize(Some("nope".into()), 1024), 1024);
  }

  #[test]
  fn parses_bools() {
    assert!(parse_bool(Some("1".into()), false));
    assert!(parse_bool(Some("true".into()), false));
    assert!(!parse_bool(Some("0".into()), true));
    assert!(!parse_bool(Some("garbage".into()), false));
    assert!(parse_bool(None, true));
  }

  #[test]
  fn now_millis_is_monotonic() {
    let a = now_millis();
    let b = now_millis();
    assert!(b >= a);
  }
}
