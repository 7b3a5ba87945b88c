//! Shared admission gate for the upstream mail provider.
//!
//! Leaky-bucket budget over a rolling window plus a minimum inter-request
//! spacing. All requests serialize through one async mutex held across the
//! wait, so a burst cannot exceed the budget.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct GateState {
    window_started_at: Instant,
    admitted_in_window: u32,
    last_admitted_at: Option<Instant>,
}

pub struct RateGate {
    config: RateLimitConfig,
    state: Mutex<GateState>,
}

impl RateGate {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(GateState {
                window_started_at: Instant::now(),
                admitted_in_window: 0,
                last_admitted_at: None,
            }),
            config,
        }
    }

    /// Wait until a request may proceed, then record the admission.
    pub async fn admit(&self) {
        let mut state = self.state.lock().await;
        let window = Duration::from_millis(self.config.window_ms);
        let spacing = Duration::from_millis(self.config.min_spacing_ms);

        loop {
            let now = Instant::now();

            if now.duration_since(state.window_started_at) >= window {
                state.window_started_at = now;
                state.admitted_in_window = 0;
            }

            let spacing_wait = state
                .last_admitted_at
                .map(|last| spacing.saturating_sub(now.duration_since(last)))
                .unwrap_or(Duration::ZERO);

            let window_wait = if state.admitted_in_window >= self.config.max_requests {
                window.saturating_sub(now.duration_since(state.window_started_at))
            } else {
                Duration::ZERO
            };

            let wait = spacing_wait.max(window_wait);
            if wait.is_zero() {
                state.admitted_in_window += 1;
                state.last_admitted_at = Some(now);
                return;
            }

            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max_requests: u32, window_ms: u64, min_spacing_ms: u64) -> RateGate {
        RateGate::new(RateLimitConfig {
            max_requests,
            window_ms,
            min_spacing_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_is_enforced_between_requests() {
        let gate = gate(100, 60_000, 1_000);
        let start = Instant::now();

        gate.admit().await;
        gate.admit().await;
        gate.admit().await;

        assert!(start.elapsed() >= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_beyond_budget_waits_for_window() {
        let gate = gate(2, 10_000, 0);
        let start = Instant::now();

        gate.admit().await;
        gate.admit().await;
        assert!(start.elapsed() < Duration::from_millis(100));

        gate.admit().await;
        assert!(start.elapsed() >= Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_serialize() {
        let gate = std::sync::Arc::new(gate(100, 60_000, 500));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.admit().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(1_500));
    }
}
