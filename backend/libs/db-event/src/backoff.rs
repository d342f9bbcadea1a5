//! Exponential backoff with jitter.
//!
//! The first delay is `initial_backoff_ms`. Every following delay is drawn
//! uniformly from `[prev * (1 - f), prev * (1 + f))` and then multiplied by
//! `backoff_multiplier`, where `f` is the random factor. `reset` forgets the
//! previous delay so the next call starts over at the initial value.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;
const DEFAULT_BACKOFF_MULTIPLIER: u64 = 2;
const DEFAULT_BACKOFF_RANDOM_FACTOR: f64 = 0.2;

/// Random factor value that selects deterministic backoff.
pub const NO_JITTER: f64 = -1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay returned by the first call after construction or reset
    pub initial_backoff_ms: u64,
    /// Growth factor applied to every following delay
    pub backoff_multiplier: u64,
    /// Jitter range as a fraction of the previous delay (`-1` disables jitter)
    pub backoff_random_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_random_factor: DEFAULT_BACKOFF_RANDOM_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Replace zero values with defaults and map the `-1` sentinel to a factor of 0.
    fn normalized(mut self) -> Self {
        if self.initial_backoff_ms == 0 {
            self.initial_backoff_ms = DEFAULT_INITIAL_BACKOFF_MS;
        }
        if self.backoff_multiplier == 0 {
            self.backoff_multiplier = DEFAULT_BACKOFF_MULTIPLIER;
        }
        if self.backoff_random_factor == 0.0 {
            self.backoff_random_factor = DEFAULT_BACKOFF_RANDOM_FACTOR;
        } else if self.backoff_random_factor == NO_JITTER {
            self.backoff_random_factor = 0.0;
        }
        self.backoff_random_factor = self.backoff_random_factor.clamp(0.0, 1.0);
        self
    }
}

/// Retry pacing used by the consumer loop.
///
/// The consumer owns one instance per failure path so that fetch failures and
/// handler failures never share retry pressure.
#[async_trait]
pub trait Backoffer: Send {
    /// Sleep for the next backoff delay.
    async fn sleep_backoff(&mut self);

    /// Forget the previous delay.
    fn reset_sleep_backoff(&mut self);
}

#[derive(Debug, Clone)]
pub struct Backoff {
    previous_backoff_ms: Option<u64>,
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            previous_backoff_ms: None,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Compute the next delay in milliseconds and remember it.
    pub fn next_backoff_ms(&mut self) -> u64 {
        let sleep_ms = match self.previous_backoff_ms {
            None => self.config.initial_backoff_ms,
            Some(prev) => {
                let factor = self.config.backoff_random_factor;
                let min = (prev as f64 * (1.0 - factor)) as u64;
                let max = (prev as f64 * (1.0 + factor)) as u64;

                let base_ms = if max > min {
                    rand::thread_rng().gen_range(min..max)
                } else {
                    min
                };

                base_ms.saturating_mul(self.config.backoff_multiplier)
            }
        };

        self.previous_backoff_ms = Some(sleep_ms);
        sleep_ms
    }

    pub fn reset(&mut self) {
        self.previous_backoff_ms = None;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[async_trait]
impl Backoffer for Backoff {
    async fn sleep_backoff(&mut self) {
        let sleep_ms = self.next_backoff_ms();
        debug!(backoff_ms = sleep_ms, "Backing off");
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
    }

    fn reset_sleep_backoff(&mut self) {
        self.reset();
    }
}
