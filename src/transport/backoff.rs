//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Parameters of the retry schedule.
///
/// The n-th wait is `initial_interval * multiplier^n`, capped at
/// `max_interval` and then randomized by `± randomization_factor`. Retrying
/// stops when either `max_retries` retries have been made or the next wait
/// would push the total elapsed time past `max_elapsed_time`.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct BackoffPolicy {
    #[builder(default = Duration::from_millis(100))]
    pub initial_interval: Duration,
    #[builder(default = 0.5)]
    pub randomization_factor: f64,
    #[builder(default = 1.5)]
    pub multiplier: f64,
    #[builder(default = Duration::from_secs(10))]
    pub max_interval: Duration,
    #[builder(default = Duration::from_secs(15))]
    pub max_elapsed_time: Duration,
    /// Retries after the first attempt.
    #[builder(default = 5)]
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BackoffPolicy {
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: self.clone(),
            current_interval: self.initial_interval,
            retries: 0,
        }
    }
}

/// Running state of one retry loop.
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current_interval: Duration,
    retries: u32,
}

impl ExponentialBackoff {
    /// Returns the next wait, or `None` once a bound has been reached.
    ///
    /// `elapsed` is the wall-clock time spent in the retry loop so far.
    pub fn next_backoff(&mut self, elapsed: Duration) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }

        let delay = jitter(self.current_interval, self.policy.randomization_factor);
        if elapsed + delay > self.policy.max_elapsed_time {
            return None;
        }

        self.retries += 1;
        self.current_interval = self
            .current_interval
            .mul_f64(self.policy.multiplier.max(1.0))
            .min(self.policy.max_interval);

        Some(delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 {
        return interval;
    }

    let delta = interval.as_secs_f64() * factor;
    let low = interval.as_secs_f64() - delta;
    let high = interval.as_secs_f64() + delta;

    Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
}
