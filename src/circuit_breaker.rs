//! Circuit breaker (spec §4.I). Grounded directly on the pack's
//! `CircuitBreaker` (`other_examples/.../position_monitor.rs`):
//! `AtomicU8` state, `AtomicU32` failure accounting, a
//! `parking_lot::Mutex<Option<Instant>>` last-transition timestamp.
//! Extended with a bounded sliding window to satisfy the spec's dual
//! "N failures OR error-rate%" trip condition, which the pack's
//! simpler threshold-only breaker does not need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub error_rate_window: usize,
    pub error_rate_threshold: f64,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_rate_window: 20,
            error_rate_threshold: 0.5,
            cooldown: Duration::from_secs(60),
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
    window: Mutex<VecDeque<bool>>,
    half_open_inflight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(State::Closed as u8),
            opened_at: Mutex::new(None),
            window: Mutex::new(VecDeque::new()),
            half_open_inflight: AtomicBool::new(false),
        }
    }

    fn current_state(&self) -> State {
        State::from(self.state.load(Ordering::SeqCst))
    }

    /// Returns whether a call is permitted right now. In `HALF_OPEN`
    /// exactly one trial call is permitted at a time.
    pub fn allow(&self) -> bool {
        match self.current_state() {
            State::Closed => true,
            State::HalfOpen => !self.half_open_inflight.swap(true, Ordering::AcqRel),
            State::Open => {
                let elapsed = self.opened_at.lock().map(|t| t.elapsed());
                if let Some(elapsed) = elapsed {
                    if elapsed >= self.config.cooldown {
                        self.transition_to_half_open();
                        return self.allow();
                    }
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        if self.current_state() == State::HalfOpen {
            self.transition_to_closed();
            return;
        }
        self.push_window(true);
    }

    pub fn record_failure(&self) {
        if self.current_state() == State::HalfOpen {
            self.transition_to_open();
            self.half_open_inflight.store(false, Ordering::Relaxed);
            return;
        }
        self.push_window(false);
        self.evaluate_closed_threshold();
    }

    pub fn state_name(&self) -> &'static str {
        match self.current_state() {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }

    fn push_window(&self, ok: bool) {
        let mut w = self.window.lock();
        if w.len() >= self.config.error_rate_window {
            w.pop_front();
        }
        w.push_back(ok);
    }

    fn evaluate_closed_threshold(&self) {
        let (failures, len) = {
            let w = self.window.lock();
            (w.iter().filter(|ok| !**ok).count() as u32, w.len())
        };
        let rate_tripped = len >= self.config.error_rate_window
            && (failures as f64 / len as f64) >= self.config.error_rate_threshold;
        if failures >= self.config.failure_threshold || rate_tripped {
            self.transition_to_open();
        }
    }

    fn transition_to_open(&self) {
        warn!(breaker = %self.name, "circuit breaker opening");
        self.state.store(State::Open as u8, Ordering::SeqCst);
        *self.opened_at.lock() = Some(Instant::now());
        self.window.lock().clear();
    }

    fn transition_to_half_open(&self) {
        self.state.store(State::HalfOpen as u8, Ordering::SeqCst);
        self.half_open_inflight.store(false, Ordering::Relaxed);
    }

    fn transition_to_closed(&self) {
        self.state.store(State::Closed as u8, Ordering::SeqCst);
        self.window.lock().clear();
    }
}

/// Per-endpoint breaker instances (spec §4.I: "broker orders, broker
/// positions, broker quotes" each get independent state).
pub struct BreakerRegistry {
    pub orders: Arc<CircuitBreaker>,
    pub positions: Arc<CircuitBreaker>,
    pub quotes: Arc<CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            orders: Arc::new(CircuitBreaker::new("broker.orders", config)),
            positions: Arc::new(CircuitBreaker::new("broker.positions", config)),
            quotes: Arc::new(CircuitBreaker::new("broker.quotes", config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            error_rate_window: 20,
            error_rate_threshold: 0.5,
            cooldown: Duration::from_millis(50),
        }
    }

    #[test]
    fn s6_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            assert!(cb.allow());
            cb.record_failure();
        }
        assert_eq!(cb.state_name(), "open");
        assert!(!cb.allow());
    }

    #[test]
    fn half_open_success_closes() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow()); // transitions to half-open and permits trial
        cb.record_success();
        assert_eq!(cb.state_name(), "closed");
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state_name(), "open");
        assert!(!cb.allow());
    }

    #[test]
    fn half_open_permits_only_one_inflight_trial() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn error_rate_trips_even_below_raw_failure_threshold() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 100,
            error_rate_window: 10,
            error_rate_threshold: 0.5,
            cooldown: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", cfg);
        for _ in 0..5 {
            cb.record_success();
        }
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state_name(), "open");
    }
}
