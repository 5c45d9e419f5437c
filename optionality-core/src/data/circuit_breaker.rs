//! Circuit breaker for the vendor REST API.
//!
//! HTTP 403 on the REST API means the key has been blocked; repeated 429s or
//! 5xx mean the vendor is struggling. Either way the breaker opens and every
//! request fails fast until the cooldown elapses (default 10 minutes).

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Strike count and, while open, the instant requests may resume.
#[derive(Debug, Default)]
struct Gate {
    strikes: u32,
    open_until: Option<Instant>,
}

/// Shared by every request thread of one REST client.
#[derive(Debug)]
pub struct CircuitBreaker {
    gate: Mutex<Gate>,
    cooldown: Duration,
    max_strikes: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            gate: Mutex::new(Gate::default()),
            cooldown,
            max_strikes: 3,
        }
    }

    /// 10-minute cooldown, opens on the third strike in a row.
    pub fn default_vendor() -> Self {
        Self::new(Duration::from_secs(10 * 60))
    }

    pub fn with_failure_threshold(mut self, strikes: u32) -> Self {
        self.max_strikes = strikes.max(1);
        self
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// False while open. The first call after the cooldown closes the gate
    /// and clears the strikes.
    pub fn is_allowed(&self) -> bool {
        let mut gate = self.gate();
        match gate.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *gate = Gate::default();
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.gate().strikes = 0;
    }

    /// One more strike; opens the gate once `max_strikes` are in a row.
    pub fn record_failure(&self) {
        let mut gate = self.gate();
        gate.strikes = gate.strikes.saturating_add(1);
        if gate.strikes >= self.max_strikes && gate.open_until.is_none() {
            gate.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    /// Open immediately, for a blocked key.
    pub fn trip(&self) {
        self.gate().open_until = Some(Instant::now() + self.cooldown);
    }

    pub fn remaining_cooldown(&self) -> Duration {
        self.gate()
            .open_until
            .map_or(Duration::ZERO, |until| {
                until.saturating_duration_since(Instant::now())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Duration::from_secs(60))
    }

    #[test]
    fn fresh_breaker_lets_requests_through() {
        let cb = breaker();
        assert!(cb.is_allowed());
        assert_eq!(cb.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn third_strike_opens() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_allowed());
        cb.record_failure();
        assert!(!cb.is_allowed());
    }

    #[test]
    fn blocked_key_opens_at_once() {
        let cb = breaker();
        cb.trip();
        assert!(!cb.is_allowed());
        assert!(cb.remaining_cooldown() > Duration::from_secs(59));
    }

    #[test]
    fn success_clears_strikes() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.is_allowed());
    }

    #[test]
    fn single_strike_threshold() {
        let cb = breaker().with_failure_threshold(0);
        cb.record_failure();
        assert!(!cb.is_allowed());
    }

    #[test]
    fn closes_after_cooldown_with_clean_slate() {
        let cb = CircuitBreaker::new(Duration::from_millis(10)).with_failure_threshold(2);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_allowed());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
        // Strikes were cleared on reopening.
        cb.record_failure();
        assert!(cb.is_allowed());
    }
}
