//! Stall Watchdog
//!
//! A resettable deadline bound to one running process. The session loop polls
//! [`StallWatchdog::expired`] next to the process streams; every observed unit of
//! output calls [`StallWatchdog::reset`]. When the deadline passes the loop calls
//! [`StallWatchdog::try_fire`], and only on `true` kills the process.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Armed(Instant),
    Fired,
    Disarmed,
}

#[derive(Debug)]
pub struct StallWatchdog {
    timeout: Duration,
    state: WatchdogState,
}

impl StallWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: WatchdogState::Disarmed,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            WatchdogState::Armed(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// Start (or restart) the deadline one timeout from now.
    pub fn arm(&mut self) {
        self.state = WatchdogState::Armed(Instant::now() + self.timeout);
    }

    /// Push the deadline out again. No effect once fired or disarmed.
    pub fn reset(&mut self) {
        if matches!(self.state, WatchdogState::Armed(_)) {
            self.arm();
        }
    }

    /// Cancel for good. A watchdog that already fired stays fired.
    pub fn disarm(&mut self) {
        if matches!(self.state, WatchdogState::Armed(_)) {
            self.state = WatchdogState::Disarmed;
        }
    }

    /// Completes when the current deadline passes. Never completes unless armed.
    pub async fn expired(&self) {
        match self.state {
            WatchdogState::Armed(deadline) => sleep_until(deadline).await,
            _ => std::future::pending::<()>().await,
        }
    }

    /// Transition to `Fired` if the deadline has really passed.
    ///
    /// Returns `false` when a reset moved the deadline after `expired` resolved, or
    /// when the watchdog is not armed, so a fire can happen at most once per arm cycle.
    pub fn try_fire(&mut self) -> bool {
        match self.state {
            WatchdogState::Armed(deadline) if Instant::now() >= deadline => {
                self.state = WatchdogState::Fired;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const FIVE_SECS: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_reset_extends_deadline() {
        let mut wd = StallWatchdog::new(FIVE_SECS);
        wd.arm();
        let first = wd.deadline().unwrap();

        advance(Duration::from_millis(10)).await;
        wd.reset();
        let second = wd.deadline().unwrap();
        assert!(second > first);
        assert_eq!(second - first, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_exactly_once() {
        let mut wd = StallWatchdog::new(FIVE_SECS);
        wd.arm();
        wd.expired().await;
        assert!(wd.try_fire());
        assert_eq!(wd.state(), WatchdogState::Fired);
        assert!(!wd.try_fire());

        // no second expiry after firing
        assert!(timeout(Duration::from_secs(60), wd.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_keeps_it_alive() {
        let mut wd = StallWatchdog::new(FIVE_SECS);
        wd.arm();
        for _ in 0..10 {
            advance(Duration::from_secs(4)).await;
            assert!(!wd.try_fire());
            wd.reset();
        }
        assert!(matches!(wd.state(), WatchdogState::Armed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_fire_is_ignored() {
        let mut wd = StallWatchdog::new(FIVE_SECS);
        wd.arm();
        advance(FIVE_SECS).await;
        // a line arrived between expiry and the fire check
        wd.reset();
        assert!(!wd.try_fire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels() {
        let mut wd = StallWatchdog::new(FIVE_SECS);
        wd.arm();
        wd.disarm();
        assert_eq!(wd.state(), WatchdogState::Disarmed);
        assert!(timeout(Duration::from_secs(60), wd.expired()).await.is_err());
        assert!(!wd.try_fire());

        wd.reset();
        assert_eq!(wd.state(), WatchdogState::Disarmed);
    }
}
