//! Clock and secret-source abstractions.
//!
//! Every time-of-day read in the control plane goes through [`Clock`] and
//! every random-bytes read through [`SecretSource`], so tests can inject
//! deterministic implementations and assert equality of resulting state.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually-advanced clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Source of cryptographically secure random bytes.
pub trait SecretSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Production secret source backed by the OS CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSecrets;

impl SecretSource for SystemSecrets {
    fn fill(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

/// Deterministic secret source for tests: hands out the queued byte strings
/// in order, then falls back to a counter pattern.
#[derive(Debug, Clone, Default)]
pub struct FixedSecrets {
    queue: Arc<Mutex<Vec<Vec<u8>>>>,
    counter: Arc<Mutex<u8>>,
}

impl FixedSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a byte string to be returned by the next `fill` call.
    pub fn push(&self, bytes: Vec<u8>) {
        self.queue.lock().unwrap().push(bytes);
    }
}

impl SecretSource for FixedSecrets {
    fn fill(&self, buf: &mut [u8]) {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            let mut counter = self.counter.lock().unwrap();
            *counter = counter.wrapping_add(1);
            buf.fill(*counter);
        } else {
            let next = queue.remove(0);
            for (dst, src) in buf.iter_mut().zip(next.iter().cycle()) {
                *dst = *src;
            }
        }
    }
}
