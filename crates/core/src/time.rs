//! Integer logical time (HLAinteger64Time).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// A point on the federation's logical time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTime(pub i64);

/// A non-negative distance between two logical times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTimeInterval(pub i64);

impl LogicalTime {
    /// Time every federate starts at.
    pub const INITIAL: LogicalTime = LogicalTime(0);
    /// Largest representable time.
    pub const FINAL: LogicalTime = LogicalTime(i64::MAX);

    /// Raw value.
    pub fn value(self) -> i64 {
        self.0
    }

    /// The smallest time strictly greater than this one.
    pub fn successor(self) -> LogicalTime {
        self + LogicalTimeInterval::EPSILON
    }

    /// `self - interval`, saturating at `i64::MIN`.
    pub fn saturating_sub(self, interval: LogicalTimeInterval) -> LogicalTime {
        LogicalTime(self.0.saturating_sub(interval.0))
    }
}

impl LogicalTimeInterval {
    /// Zero-length interval.
    pub const ZERO: LogicalTimeInterval = LogicalTimeInterval(0);
    /// Smallest positive interval.
    pub const EPSILON: LogicalTimeInterval = LogicalTimeInterval(1);

    /// Raw value.
    pub fn value(self) -> i64 {
        self.0
    }

    /// True for strictly positive intervals; only those are valid lookaheads.
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl Add<LogicalTimeInterval> for LogicalTime {
    type Output = LogicalTime;

    fn add(self, rhs: LogicalTimeInterval) -> LogicalTime {
        LogicalTime(self.0.saturating_add(rhs.0))
    }
}

impl Default for LogicalTime {
    fn default() -> Self {
        LogicalTime::INITIAL
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalTimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
