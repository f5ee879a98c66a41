//! Single-flight guard for embedding batches.
//!
//! At most one batch may be in flight at a time. The flag is taken with a
//! compare-exchange and released when the [`FlightPermit`] is dropped, which
//! also happens while a panicking batch task unwinds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared in-flight flag.
#[derive(Clone, Default)]
pub struct SingleFlight {
    in_flight: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the flag if nobody holds it.
    pub fn try_acquire(&self) -> Option<FlightPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit {
                in_flight: self.in_flight.clone(),
            })
    }

    /// Whether a permit is currently held.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Proof of holding the flag; releases it on drop.
#[must_use = "the guard is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct FlightPermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
