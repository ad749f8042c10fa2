//! Wall-clock deadline for bounding query latency.
//!
//! A [`Deadline`] is computed once at the top of a recall and passed by
//! reference down the pipeline. Each stage calls [`Deadline::check`] before
//! expensive work and periodically during scans. Works from any thread —
//! no signal handlers, no process-global state.

use std::time::{Duration, Instant};

use crate::error::Error;

/// An instant beyond which an operation must abort with `Timeout`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    expires: Option<Instant>,
}

impl Deadline {
    /// Deadline `timeout_ms` from now. `0` means "no deadline".
    pub fn after_ms(timeout_ms: u64) -> Self {
        let started = Instant::now();
        let expires = if timeout_ms == 0 {
            None
        } else {
            Some(started + Duration::from_millis(timeout_ms))
        };
        Self { started, expires }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self::after_ms(0)
    }

    /// Milliseconds elapsed since the deadline was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// True once the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.expires, Some(at) if Instant::now() >= at)
    }

    /// Time left before expiry, or `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Err(`Timeout`) once the deadline has passed, Ok otherwise.
    pub fn check(&self) -> Result<(), Error> {
        if self.expired() {
            Err(Error::Timeout {
                elapsed_ms: self.elapsed_ms(),
            })
        } else {
            Ok(())
        }
    }
}
