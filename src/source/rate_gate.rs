// src/source/rate_gate.rs
//! Global spacing between outbound requests.
//!
//! One gate is shared by every request a job makes (resolver probes, listing
//! pages and document fetches), so adding workers overlaps waiting and parsing
//! but never raises the request rate seen by the source site.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RateGate {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Claims the next free slot and returns the instant it opens.
    fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next = self.next_slot.lock().unwrap_or_else(|p| p.into_inner());
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.spacing);
        slot
    }

    /// Waits for a slot. Returns `false` if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let slot = self.reserve();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(slot)) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_request_passes_immediately() {
        let gate = RateGate::new(Duration::from_secs(5));
        let started = Instant::now();
        assert!(gate.wait(&CancellationToken::new()).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn concurrent_waiters_are_spaced_globally() {
        let gate = Arc::new(RateGate::new(Duration::from_millis(60)));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                gate.wait(&cancel).await;
                Instant::now()
            }));
        }
        let mut passed = Vec::new();
        for h in handles {
            passed.push(h.await.unwrap());
        }
        passed.sort();

        // Four slots at 0, 60, 120 and 180ms; a waiter never passes early.
        for (i, at) in passed.iter().enumerate() {
            let earliest = Duration::from_millis(60 * i as u64).saturating_sub(Duration::from_millis(5));
            assert!(at.duration_since(started) >= earliest, "waiter {} passed early", i);
        }
    }

    #[tokio::test]
    async fn cancellation_releases_waiters() {
        let gate = RateGate::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        assert!(gate.wait(&cancel).await);

        let waiter_cancel = cancel.clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waiter_cancel.cancel();
        });
        let started = Instant::now();
        assert!(!gate.wait(&cancel).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.await.unwrap();

        // Already cancelled: no slot is even reserved.
        assert!(!gate.wait(&cancel).await);
    }
}
