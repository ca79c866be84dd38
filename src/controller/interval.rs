//! Requeue interval returned by an inspection tick

use std::fmt;
use std::time::Duration;

/// Time until the next inspection. Only ever shrinks while a tick runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval(Duration);

impl Interval {
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Shorten the interval to at most `limit`
    #[must_use]
    pub fn reduce_to(self, limit: Duration) -> Self {
        Self(self.0.min(limit))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl From<Interval> for Duration {
    fn from(interval: Interval) -> Self {
        interval.0
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
