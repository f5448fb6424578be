//! Per-source circuit breakers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; the source is skipped.
    Open,
    /// Cooldown elapsed; the next call decides.
    HalfOpen,
}

/// Circuit breaker for one mirror source.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    opened_at: RwLock<Option<Instant>>,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            opened_at: RwLock::new(None),
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.check_state_transition();
        *self.state.read()
    }

    pub fn is_allowed(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), CircuitState::Closed);
        self.failure_count.store(0, Ordering::SeqCst);
        if previous == CircuitState::HalfOpen {
            info!("Circuit breaker closed after successful recovery");
        }
    }

    pub fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.open();
                    warn!(failures, "Circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                self.open();
                debug!("Circuit breaker reopened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        *self.state.write() = CircuitState::Open;
        *self.opened_at.write() = Some(Instant::now());
    }

    fn check_state_transition(&self) {
        let state = *self.state.read();
        if state == CircuitState::Open
            && let Some(opened_at) = *self.opened_at.read()
            && opened_at.elapsed() >= self.cooldown
        {
            *self.state.write() = CircuitState::HalfOpen;
            debug!("Circuit breaker transitioned to half-open state");
        }
    }
}

/// Breakers keyed by source name.
pub struct SourceBreakers {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl SourceBreakers {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    pub fn get(&self, source: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(source) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.failure_threshold, self.cooldown)))
            .clone()
    }

    pub fn is_allowed(&self, source: &str) -> bool {
        self.get(source).is_allowed()
    }

    pub fn record_success(&self, source: &str) {
        self.get(source).record_success();
    }

    pub fn record_failure(&self, source: &str) {
        self.get(source).record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_allowed());
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_sources_are_isolated() {
        let breakers = SourceBreakers::new(1, Duration::from_secs(60));
        breakers.record_failure("alpha");
        assert!(!breakers.is_allowed("alpha"));
        assert!(breakers.is_allowed("beta"));
    }
}
