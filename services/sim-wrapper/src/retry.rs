use std::{future::Future, time::Duration};

use tracing::debug;

use crate::config::RetryConfig;

/// Bounded exponential backoff: the delay doubles after every failed attempt
/// and is capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl From<RetryConfig> for Backoff {
    fn from(config: RetryConfig) -> Self {
        Self {
            attempts: config.attempts,
            initial: config.initial,
            max: config.max,
        }
    }
}

impl Backoff {
    /// Delays slept between consecutive attempts; one fewer than `attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max = self.max;
        let count = self.attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial.min(max)), move |delay| {
            Some(max.min(*delay * 2))
        })
        .take(count)
    }
}

/// Runs `op` until it yields `Some`, sleeping per `backoff` in between.
/// Returns `Ok(None)` once all attempts are used up. Errors end the loop
/// immediately.
pub async fn poll<T, E, F, Fut>(backoff: Backoff, mut op: F) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut delays = backoff.delays();
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(value) = op(attempt).await? {
            return Ok(Some(value));
        }
        let Some(delay) = delays.next() else {
            return Ok(None);
        };
        debug!(attempt, ?delay, "not ready, backing off");
        tokio::time::sleep(delay).await;
    }
}
