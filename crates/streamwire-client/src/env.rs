//! Environment abstraction for deterministic testing.
//!
//! Decouples the subscriber state machine from system resources (time,
//! randomness). Production code uses [`SystemEnv`]; tests use
//! [`test_utils::MockEnv`] with a manually advanced clock and seeded
//! byte sequence, so resend-retry deadlines are exercised without
//! sleeping.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards within one execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Deadlines are computed as `now() + timeout` and compared on `Tick`
    /// events, so the instant must support duration arithmetic.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + std::ops::Add<Duration, Output = Self::Instant>
        + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, used for request ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0_u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Production environment using system time and the OS cryptographic RNG.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buffer);
    }
}

/// Deterministic environment for tests.
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use super::Environment;

    struct MockState {
        now: Instant,
        counter: u64,
    }

    /// Test environment with a manually advanced clock and a counter-backed
    /// byte source. Clones share the same clock.
    #[derive(Clone)]
    pub struct MockEnv {
        inner: Arc<Mutex<MockState>>,
    }

    impl MockEnv {
        /// Create a mock environment anchored at the current instant.
        #[must_use]
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(MockState { now: Instant::now(), counter: 0 })),
            }
        }

        /// Advance the mock clock.
        pub fn advance(&self, duration: Duration) {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner).now += duration;
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Self::Instant {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner).now
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            for byte in buffer.iter_mut() {
                state.counter = state.counter.wrapping_add(1);
                *byte = (state.counter & 0xff) as u8;
            }
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    mod tests {
        use super::*;

        #[test]
        fn clock_is_shared_between_clones() {
            let env = MockEnv::new();
            let clone = env.clone();
            let before = clone.now();
            env.advance(Duration::from_secs(5));
            assert_eq!(clone.now() - before, Duration::from_secs(5));
        }

        #[test]
        fn byte_source_is_deterministic() {
            let a = MockEnv::new();
            let b = MockEnv::new();
            assert_eq!(a.random_u64(), b.random_u64());
        }
    }
}
