//! Time-correlation core: pairs the hardware timing stream with
//! side-channel updates and emits exactly one contribution per trigger.
//!
//! Two engines share this module: [`bld_worker`] walks multiple
//! timestamp-ordered multicast sources against the timing stream, and
//! [`two_queue`] matches a single PV/encoder queue head-to-head with the
//! trigger queue.

pub mod bld_worker;
pub mod two_queue;

pub use bld_worker::BldWorker;
pub use two_queue::{MatchWorker, SideMode};

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Duration;

use crate::dgram::Timestamp;

/// How precisely a side-channel timestamp must agree with the trigger.
///
/// `Fiducial` tolerates clock drift up to 10 ms over a fiducial-masked
/// comparison; it is fragile when drift exceeds the window and stays
/// disabled unless explicitly overridden at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDegree {
    /// Everything matches (sources without usable timestamps).
    None,
    /// Fiducial-masked comparison with a 10 ms window.
    Fiducial,
    /// Full 64-bit equality.
    Strict,
}

/// Fiducial bits masked out of a degree-1 comparison.
const FIDUCIAL_MASK: u64 = !0x1ffff;

/// Drift tolerance of the degree-1 comparison.
const FIDUCIAL_DELTA: u64 = 10_000_000;

/// Compare a trigger timestamp against a side-channel timestamp under the
/// given match degree. `Ordering::Equal` means "same event".
pub fn compare(ts1: Timestamp, ts2: Timestamp, degree: MatchDegree) -> Ordering {
    match degree {
        MatchDegree::None => {
            // The sentinel must still order so timeout sweeps work.
            if ts2 == Timestamp::MAX {
                ts1.cmp(&ts2)
            } else {
                Ordering::Equal
            }
        }
        MatchDegree::Fiducial => {
            let a = ts1.value() & FIDUCIAL_MASK;
            let b = ts2.value() & FIDUCIAL_MASK;
            if a > b && a - b > FIDUCIAL_DELTA {
                Ordering::Greater
            } else if b > a && b - a > FIDUCIAL_DELTA {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        MatchDegree::Strict => ts1.cmp(&ts2),
    }
}

/// Matching counters shared with the metrics registry.
#[derive(Default)]
pub struct MatchStats {
    pub n_events: AtomicU64,
    pub n_match: AtomicU64,
    pub n_empty: AtomicU64,
    pub n_missed: AtomicU64,
    pub n_too_old: AtomicU64,
    pub n_timed_out: AtomicU64,
    pub time_diff_ns: AtomicI64,
}

/// Static knobs of a matching worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Per-slot budget for L1Accept contributions.
    pub pebble_buf_size: usize,
    /// Budget for transition contributions.
    pub max_tr_size: usize,
    /// Pebbles older than `now - match_tmo` are flushed with TimedOut.
    pub match_tmo: Duration,
    pub degree: MatchDegree,
    /// Idle period after which the event-builder batch is flushed.
    pub idle_flush: Duration,
}

/// Idle-flush period derived from the event builder's batch depth.
pub fn idle_flush_period(max_entries: usize) -> Duration {
    Duration::from_micros((1.1 * max_entries as f64 * 14.0 / 13.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_compare() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(10, 1);
        assert_eq!(compare(a, a, MatchDegree::Strict), Ordering::Equal);
        assert_eq!(compare(a, b, MatchDegree::Strict), Ordering::Less);
        assert_eq!(compare(b, a, MatchDegree::Strict), Ordering::Greater);
    }

    #[test]
    fn test_degree_none_matches_everything_but_sentinel() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(99, 0);
        assert_eq!(compare(a, b, MatchDegree::None), Ordering::Equal);
        assert_eq!(compare(a, Timestamp::MAX, MatchDegree::None), Ordering::Less);
    }

    #[test]
    fn test_fiducial_tolerates_small_drift() {
        let a = Timestamp::from_value(0x1000_0000_0000_0000);
        let b = Timestamp::from_value(0x1000_0000_0000_0000 + 0x1ffff);
        assert_eq!(compare(a, b, MatchDegree::Fiducial), Ordering::Equal);
    }

    #[test]
    fn test_fiducial_rejects_large_drift() {
        let a = Timestamp::from_value(0x1000_0000_0000_0000);
        let b = Timestamp::from_value(0x1000_0000_0000_0000 + 0x4_000_0000);
        assert_eq!(compare(a, b, MatchDegree::Fiducial), Ordering::Less);
        assert_eq!(compare(b, a, MatchDegree::Fiducial), Ordering::Greater);
    }

    #[test]
    fn test_idle_flush_period_scales_with_batch_depth() {
        let d64 = idle_flush_period(64);
        let d512 = idle_flush_period(512);
        assert!(d64 < d512);
        assert_eq!(d64, Duration::from_micros(75));
    }
}
