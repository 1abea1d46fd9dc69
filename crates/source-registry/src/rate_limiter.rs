use std::sync::Mutex;
use std::time::Instant;

/// Token-bucket limiter, one per source. A fetch that would exceed the
/// bucket fails fast rather than queueing; the next cycle retries anyway.
///
/// Refill is computed lazily from elapsed time, so there is no background
/// task to manage.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `rpm` requests per minute; the bucket holds one minute's allowance.
    pub fn per_minute(rpm: u32) -> Self {
        let capacity = rpm.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        let state = self.state.lock().expect("token bucket lock poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}
