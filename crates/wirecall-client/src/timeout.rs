use std::time::{Duration, Instant};

/// A call deadline.
///
/// The window covers issuing the request through receiving the response
/// *header*; response body transfer is not counted. Expiry is a failure,
/// never a retry — retry policy belongs to the caller.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
    deadline: Option<Instant>,
}

impl Timeout {
    /// A deadline `duration` from now.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: Some(Instant::now() + duration),
        }
    }

    /// No deadline.
    pub fn never() -> Self {
        Self {
            duration: Duration::MAX,
            deadline: None,
        }
    }

    /// The originally configured window.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time left, or `None` for an unbounded timeout. Returns
    /// `Some(Duration::ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::never()
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::new(duration)
    }
}
