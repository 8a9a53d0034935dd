//! Blink timeout watchdog.
//!
//! [`BlinkMonitor`] is not a free-running timer task. It only stores a
//! deadline; the owner polls [`BlinkMonitor::expired`] from the same
//! `tokio::select!` loop that processes device messages, so a timeout and a
//! `BlinkDetected` are always handled one after the other, never concurrently.
//! That also makes `disarm()` synchronous: once it returns, the next poll of
//! `expired()` cannot observe the old deadline.

use tokio::time::{sleep_until, Duration, Instant};

#[derive(Debug, Default)]
pub struct BlinkMonitor {
    /// Configured no-blink interval; `None` while disarmed.
    interval: Option<Duration>,
    /// Pending expiry; `None` when disarmed or already fired.
    deadline: Option<Instant>,
}

impl BlinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the countdown with a new interval.
    pub fn arm(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.deadline = Some(Instant::now() + interval);
    }

    /// Stop the countdown. Any pending expiry is cancelled.
    pub fn disarm(&mut self) {
        self.interval = None;
        self.deadline = None;
    }

    /// Restart the countdown with the current interval.
    ///
    /// Also re-starts a monitor that has already fired. No-op while disarmed.
    pub fn reset(&mut self) {
        if let Some(interval) = self.interval {
            self.deadline = Some(Instant::now() + interval);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    /// Completes once when the pending deadline passes; pending forever while
    /// disarmed or after firing until the next `reset()`/`arm()`.
    ///
    /// Cancel safe: dropping the future before it completes leaves the
    /// deadline in place.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
impl BlinkMonitor {
    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const T: Duration = Duration::from_secs(30);
    const EPS: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn fires_after_interval() {
        let mut m = BlinkMonitor::new();
        let start = Instant::now();
        m.arm(T);
        m.expired().await;
        assert_eq!(start.elapsed(), T);
        assert!(m.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_expiry() {
        let mut m = BlinkMonitor::new();
        m.arm(T);
        m.expired().await;
        assert!(timeout(T * 3, m.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_pushes_the_deadline_out() {
        let mut m = BlinkMonitor::new();
        let start = Instant::now();
        m.arm(T);

        assert!(timeout(T - EPS, m.expired()).await.is_err());
        m.reset();

        // Nothing may fire before 2T - ε total.
        assert!(timeout(T - EPS - EPS, m.expired()).await.is_err());
        m.expired().await;
        assert_eq!(start.elapsed(), T - EPS + T);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_pending_timeout() {
        let mut m = BlinkMonitor::new();
        m.arm(T);
        assert!(timeout(T - EPS, m.expired()).await.is_err());
        m.disarm();
        assert!(!m.is_armed());
        assert!(timeout(T * 4, m.expired()).await.is_err());

        // reset() does not revive a disarmed monitor.
        m.reset();
        assert!(timeout(T * 2, m.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_interval() {
        let mut m = BlinkMonitor::new();
        let start = Instant::now();
        m.arm(T);
        m.arm(Duration::from_secs(5));
        m.expired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(m.interval(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_firing_restarts_countdown() {
        let mut m = BlinkMonitor::new();
        m.arm(T);
        m.expired().await;
        let fired_at = Instant::now();
        m.reset();
        assert_eq!(m.remaining(), Some(T));
        m.expired().await;
        assert_eq!(fired_at.elapsed(), T);
    }
}
