//! Minimum spacing between dispatched upstream calls

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Spaces calls at least `60 / rpm` seconds apart.
///
/// Each caller reserves the next free slot under the lock and then sleeps
/// outside it, so concurrent callers queue up in reservation order.
#[derive(Debug)]
pub struct DispatchThrottle {
    min_spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl DispatchThrottle {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub fn from_rpm(requests_per_minute: u32) -> Self {
        Self::new(Duration::from_secs_f64(
            60.0 / f64::from(requests_per_minute.max(1)),
        ))
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Reserve the next slot; returns how long the caller must wait for it
    pub fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut next_slot = self.next_slot.lock();
        let slot = match *next_slot {
            Some(at) if at > now => at,
            _ => now,
        };
        *next_slot = Some(slot + self.min_spacing);
        slot - now
    }

    /// Wait until this caller may dispatch
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tracing::debug!("Throttling upstream call for {}ms", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
    }
}
