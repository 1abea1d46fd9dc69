use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const ERROR_RATE_WINDOW: usize = 20;
const ERROR_RATE_THRESHOLD: f64 = 0.5;

/// Breaker state as exposed to health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-source circuit breaker.
///
/// Closed -> Open after `fail_threshold` consecutive failures, or when the
/// error rate over the last 20 calls reaches 50%. Open -> HalfOpen after the
/// cooldown. HalfOpen -> Closed on one success, back to Open on any failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    fail_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// true = failure, newest at the back.
    recent: VecDeque<bool>,
}

impl CircuitBreaker {
    pub fn new(fail_threshold: u32, cooldown: Duration) -> Self {
        Self {
            fail_threshold: fail_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                recent: VecDeque::with_capacity(ERROR_RATE_WINDOW),
            }),
        }
    }

    /// Whether a call may proceed. Transitions Open -> HalfOpen when the
    /// cooldown has elapsed; in HalfOpen exactly the probing call proceeds.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        push_outcome(&mut inner.recent, false);
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        push_outcome(&mut inner.recent, true);

        let error_rate_trip = inner.recent.len() >= ERROR_RATE_WINDOW && {
            let failures = inner.recent.iter().filter(|&&f| f).count();
            failures as f64 / inner.recent.len() as f64 >= ERROR_RATE_THRESHOLD
        };

        let trip = match inner.state {
            // One probe failure re-opens immediately.
            BreakerState::HalfOpen => true,
            BreakerState::Closed => {
                inner.consecutive_failures >= self.fail_threshold || error_rate_trip
            }
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }
}

fn push_outcome(recent: &mut VecDeque<bool>, failed: bool) {
    recent.push_back(failed);
    if recent.len() > ERROR_RATE_WINDOW {
        recent.pop_front();
    }
}
