//! Optional absolute deadline carried through store and index calls.

use std::time::{Duration, Instant};

use crate::error::{Result, SiftError};

/// An optional point in time after which an operation must give up.
///
/// `Deadline::none()` never expires. Lock acquisition under a deadline uses
/// the `try_*_until` family so a blocked call returns `Timeout` instead of
/// waiting forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// A deadline `timeout` from now. A timeout too large to represent as
    /// an instant never expires.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Deadline from a millisecond budget; zero means no deadline.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::none()
        } else {
            Self::after(Duration::from_millis(ms))
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fail with `Timeout` if the deadline has passed.
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_expired() {
            Err(SiftError::timeout(operation))
        } else {
            Ok(())
        }
    }
}
