//! Shared primitive types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Delivery latency class of an event.
///
/// Ordered `Off < Normal < CostDeferred < RealTime`. Storage uses it as a
/// filter when leasing and as an eviction priority when trimming, never as
/// a queue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventLatency {
    Off,
    Normal,
    CostDeferred,
    RealTime,
}

impl EventLatency {
    /// All latency classes, lowest first.
    pub fn all() -> [EventLatency; 4] {
        [
            EventLatency::Off,
            EventLatency::Normal,
            EventLatency::CostDeferred,
            EventLatency::RealTime,
        ]
    }

    /// Integer form stored in the disk tier.
    pub fn as_i64(self) -> i64 {
        match self {
            EventLatency::Off => 0,
            EventLatency::Normal => 1,
            EventLatency::CostDeferred => 2,
            EventLatency::RealTime => 3,
        }
    }

    /// Inverse of [`EventLatency::as_i64`]. Unknown values clamp to the
    /// nearest class.
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => EventLatency::Off,
            1 => EventLatency::Normal,
            2 => EventLatency::CostDeferred,
            _ => EventLatency::RealTime,
        }
    }
}

impl Default for EventLatency {
    fn default() -> Self {
        EventLatency::Normal
    }
}

impl fmt::Display for EventLatency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventLatency::Off => "off",
            EventLatency::Normal => "normal",
            EventLatency::CostDeferred => "cost-deferred",
            EventLatency::RealTime => "real-time",
        };
        f.write_str(name)
    }
}
