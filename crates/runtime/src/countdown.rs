use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::trace;

/// Fixed-period tick source shared by the idle countdown and the session
/// inactivity counter.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    interval: Interval,
}

impl Ticker {
    /// The first tick fires one full period from now.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { period, interval }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Restart so the next tick is one full period away.
    pub fn reset(&mut self) {
        self.interval.reset();
    }
}

/// Wait for `ticks` uninterrupted ticks. Cancellation is dropping the future;
/// the next countdown starts over from a reset ticker.
pub async fn countdown(ticker: &mut Ticker, ticks: u64) {
    ticker.reset();
    for remaining in (0..ticks).rev() {
        ticker.tick().await;
        trace!(remaining, "idle countdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn countdown_takes_ticks_times_period() {
        let mut ticker = Ticker::new(Duration::from_secs(1));
        let start = Instant::now();
        countdown(&mut ticker, 120).await;
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_countdown_restarts_from_zero() {
        let mut ticker = Ticker::new(Duration::from_secs(1));
        let cancelled = tokio::time::timeout(Duration::from_millis(50_500), countdown(&mut ticker, 120)).await;
        assert!(cancelled.is_err());

        let start = Instant::now();
        countdown(&mut ticker, 120).await;
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ticks_is_immediate() {
        let mut ticker = Ticker::new(Duration::from_secs(1));
        let start = Instant::now();
        countdown(&mut ticker, 0).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
