use rand::Rng;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::warn;

/// Outcome of one attempt inside [`Backoff::retry`].
#[derive(Debug)]
pub enum Retry<E> {
    /// Give up immediately.
    Permanent(E),
    /// Worth another attempt after a delay.
    Transient(E),
}

/// Bounded exponential backoff with jitter.
///
/// Retrying stops at whichever limit is hit first: `max_retries` further
/// attempts, or `max_elapsed` wall-clock time since the first attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    pub max_retries: u32,
    /// Fraction of each delay added as random jitter (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(7),
            max_retries: 6,
            jitter_factor: 0.5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = (self.initial_interval.as_millis() as f64 * factor)
            .min(self.max_interval.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_factor);
        delay + Duration::from_millis((delay.as_millis() as f64 * jitter) as u64)
    }

    pub fn retry<T, E: Display>(
        &self,
        op: impl FnMut() -> Result<T, Retry<E>>,
    ) -> Result<T, E> {
        self.retry_with_sleep(op, std::thread::sleep)
    }

    pub fn retry_with_sleep<T, E: Display>(
        &self,
        mut op: impl FnMut() -> Result<T, Retry<E>>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, E> {
        let started = Instant::now();
        let mut waited = Duration::ZERO;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(Retry::Permanent(e)) => return Err(e),
                Err(Retry::Transient(e)) => {
                    let delay = self.jittered_delay(attempt);
                    let elapsed = started.elapsed().max(waited);
                    if attempt >= self.max_retries || elapsed + delay > self.max_elapsed {
                        warn!("giving up after {} attempts: {e}", attempt + 1);
                        return Err(e);
                    }
                    warn!("attempt {} failed, retrying in {delay:?}: {e}", attempt + 1);
                    sleep(delay);
                    waited += delay;
                    attempt += 1;
                }
            }
        }
    }
}
