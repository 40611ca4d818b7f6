use std::future::Future;
use std::time::Duration;

use tokio::time::{self as tokio_time, MissedTickBehavior};

/// Bounded retry at a fixed interval.
///
/// The first attempt runs immediately; subsequent attempts are spaced by `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Poll {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Enough attempts to cover `total` when spaced by `interval` (at least one).
    pub fn within(total: Duration, interval: Duration) -> Self {
        let step = interval.as_millis().max(1);
        let n = total.as_millis().div_ceil(step) + 1;
        Self::new(u32::try_from(n).unwrap_or(u32::MAX), interval)
    }

    /// Run `attempt` until it yields `Some`, or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let mut ticker = tokio_time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        for n in 1..=self.attempts {
            // First tick completes immediately.
            ticker.tick().await;
            if let Some(v) = attempt(n).await {
                return Some(v);
            }
        }
        None
    }

    /// Like [`Poll::run`] for plain predicates.
    pub async fn until<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.run(|_| {
            let fut = check();
            async move { fut.await.then_some(()) }
        })
        .await
        .is_some()
    }
}
