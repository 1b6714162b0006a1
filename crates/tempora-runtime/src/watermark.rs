//! Low-watermark tracking for ingress.
//!
//! [`WatermarkClock`] follows the highest sync time admitted so far and
//! derives the low watermark from it, lagged by a reorder latency. Explicit
//! punctuations can only push the watermark forward.
//!
//! [`EdgeBook`] pairs End-edges with the Start-edges they close, remembering
//! where Adjust moved a start and which starts Drop discarded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tempora_core::Timestamp;

/// Tracks the highest admitted sync time and the resulting low watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkClock {
    high: Timestamp,
    low: Timestamp,
    latency: i64,
}

impl WatermarkClock {
    pub fn new(latency: i64) -> Self {
        Self {
            high: Timestamp::MIN,
            low: Timestamp::MIN,
            latency: latency.max(0),
        }
    }

    /// Records an admitted data event. Returns true if the low watermark moved.
    pub fn observe(&mut self, sync_time: Timestamp) -> bool {
        if sync_time > self.high {
            self.high = sync_time;
        }
        let candidate = self.high.saturating_sub(self.latency);
        self.raise(candidate)
    }

    /// Applies an explicit punctuation. Returns true if the low watermark moved.
    pub fn punctuate(&mut self, time: Timestamp) -> bool {
        if time > self.high {
            self.high = time;
        }
        self.raise(time)
    }

    fn raise(&mut self, candidate: Timestamp) -> bool {
        if candidate > self.low {
            self.low = candidate;
            true
        } else {
            false
        }
    }

    /// Sync times below this are late.
    pub fn low(&self) -> Timestamp {
        self.low
    }

    pub fn high(&self) -> Timestamp {
        self.high
    }

    pub fn latency(&self) -> i64 {
        self.latency
    }
}

/// Result of looking up the Start-edge an End-edge closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClose {
    /// The start is open; carries its effective (possibly adjusted) time.
    Matched(Timestamp),
    /// The start was discarded at ingress, so the end must be too.
    Discarded,
    /// No such start was ever admitted.
    Unmatched,
}

/// Open Start-edges, keyed by their original start time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeBook {
    open: BTreeMap<Timestamp, Vec<Timestamp>>,
    discarded: BTreeMap<Timestamp, u64>,
}

impl EdgeBook {
    pub fn open_start(&mut self, original: Timestamp, effective: Timestamp) {
        self.open.entry(original).or_default().push(effective);
    }

    pub fn discard_start(&mut self, original: Timestamp) {
        *self.discarded.entry(original).or_insert(0) += 1;
    }

    pub fn close(&mut self, original: Timestamp) -> EdgeClose {
        if let Some(starts) = self.open.get_mut(&original) {
            let effective = starts.remove(0);
            if starts.is_empty() {
                self.open.remove(&original);
            }
            return EdgeClose::Matched(effective);
        }
        if let Some(count) = self.discarded.get_mut(&original) {
            *count -= 1;
            if *count == 0 {
                self.discarded.remove(&original);
            }
            return EdgeClose::Discarded;
        }
        EdgeClose::Unmatched
    }

    /// Number of Start-edges still waiting for their End-edge.
    pub fn open_count(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.discarded.is_empty()
    }
}
