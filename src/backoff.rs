//! Reconnect backoff policy.
//!
//! ```text
//!   disconnect #1 ──▶ wait initial            ──▶ delay *= growth
//!   disconnect #2 ──▶ wait initial * growth   ──▶ delay *= growth
//!   ...
//!   connected     ──▶ delay = initial
//! ```
//!
//! The delay never exceeds the configured cap. Optional jitter spreads each
//! wait by up to `±jitter` of its length; the random source is passed in so
//! tests can make it deterministic.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Exponential reconnect delay.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: f64,
    growth: f64,
    max: f64,
    jitter: f64,
    current: f64,
}

impl Backoff {
    /// Creates a policy starting at `initial` seconds, multiplied by `growth`
    /// after each scheduled attempt and capped at `max` seconds.
    pub fn new(initial: f64, growth: f64, max: f64) -> Self {
        Self {
            initial,
            growth,
            max,
            jitter: 0.0,
            current: initial.min(max),
        }
    }

    /// Builds the policy from the `reconnect_*` configuration fields.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.reconnect_initial_secs,
            config.reconnect_growth,
            config.reconnect_max_secs,
        )
        .with_jitter(config.reconnect_jitter)
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Delay in seconds that the next attempt will wait, before jitter.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Returns to the initial delay. Called on every successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// Returns the delay for the attempt being scheduled now and grows the
    /// delay for the one after.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let mut delay = self.current;
        self.current = (self.current * self.growth).min(self.max);

        if self.jitter > 0.0 {
            delay *= 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        }
        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #[test]
        fn delay_after_n_disconnects(
            initial in 0.1f64..10.0,
            growth in 1.0f64..3.0,
            n in 0u32..20,
        ) {
            let mut backoff = Backoff::new(initial, growth, f64::MAX);
            let mut rng = StdRng::seed_from_u64(0);
            for _ in 0..n {
                backoff.next_delay(&mut rng);
            }
            let expected = initial * growth.powi(n as i32);
            prop_assert!((backoff.current() - expected).abs() <= expected * 1e-9);

            backoff.reset();
            prop_assert_eq!(backoff.current(), initial);
        }

        #[test]
        fn delay_never_exceeds_cap(
            growth in 1.0f64..5.0,
            max in 1.0f64..1000.0,
            n in 1usize..50,
        ) {
            let mut backoff = Backoff::new(1.0, growth, max);
            let mut rng = StdRng::seed_from_u64(0);
            for _ in 0..n {
                let delay = backoff.next_delay(&mut rng).as_secs_f64();
                prop_assert!(delay <= max + 1e-9);
            }
        }
    }
}
