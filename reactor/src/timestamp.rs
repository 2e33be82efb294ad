//! Wall-clock timestamps attached to readiness events.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microsecond-resolution wall-clock timestamp.
///
/// Captured when the demultiplexer returns and handed to message callbacks
/// as the receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self {
            micros_since_epoch: micros,
        }
    }

    /// Microseconds since the Unix epoch.
    #[inline]
    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.micros_since_epoch / MICROS_PER_SECOND;
        let micros = self.micros_since_epoch % MICROS_PER_SECOND;
        write!(f, "{}.{:06}", seconds, micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
        assert!(a.micros_since_epoch() > 0);
    }

    #[test]
    fn display_pads_micros() {
        let ts = Timestamp {
            micros_since_epoch: 5 * MICROS_PER_SECOND + 42,
        };
        assert_eq!(ts.to_string(), "5.000042");
    }
}
