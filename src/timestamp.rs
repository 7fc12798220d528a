use serde::{Deserialize, Serialize};
use std::fmt;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Seconds + nanoseconds pair as exchanged with clock adapters.
///
/// All control math is done on the `i64` nanosecond form, which covers
/// every date up to the year 2262.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        // Normalise an out-of-range nanosecond field instead of rejecting it
        let extra = (nanoseconds as i64) / NANOS_PER_SEC;
        Timestamp {
            seconds: seconds + extra,
            nanoseconds: (nanoseconds as i64 % NANOS_PER_SEC) as u32,
        }
    }

    pub fn from_nanos(ns: i64) -> Self {
        Timestamp {
            seconds: ns.div_euclid(NANOS_PER_SEC),
            nanoseconds: ns.rem_euclid(NANOS_PER_SEC) as u32,
        }
    }

    pub fn as_nanos(&self) -> i64 {
        self.seconds * NANOS_PER_SEC + self.nanoseconds as i64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_nanos_negative_borrows_a_second() {
        let ts = Timestamp::from_nanos(-1);
        assert_eq!(ts.seconds, -1);
        assert_eq!(ts.nanoseconds, 999_999_999);
        assert_eq!(ts.as_nanos(), -1);
    }

    #[test]
    fn test_new_normalises_nanoseconds() {
        let ts = Timestamp::new(10, 1_500_000_000);
        assert_eq!(ts, Timestamp { seconds: 11, nanoseconds: 500_000_000 });
    }

    #[test]
    fn test_display_pads_fraction() {
        assert_eq!(Timestamp::new(1000, 150_000_000).to_string(), "1000.150000000");
        assert_eq!(Timestamp::new(7, 42).to_string(), "7.000000042");
    }
}
