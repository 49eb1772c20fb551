use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};

/// Recurring reconciliation timer with at most one cycle in flight.
///
/// The timer is dormant until [`SyncScheduler::start`], so nothing fires
/// during initial load. [`SyncScheduler::stop`] drops the timer and aborts
/// any in-flight cycle synchronously.
#[derive(Debug)]
pub struct SyncScheduler {
    period: Duration,
    ticker: Option<Interval>,
    in_flight: Option<JoinHandle<()>>,
    cycles: u64,
}

impl SyncScheduler {
    /// Dormant scheduler; periods below a millisecond are rounded up.
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            ticker: None,
            in_flight: None,
            cycles: 0,
        }
    }

    /// Arms the timer; the first tick lands one full period from now.
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    /// True while the timer is armed.
    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves on the next tick; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// True while a tracked cycle is still running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Records the task carrying the current cycle.
    pub fn track(&mut self, cycle: JoinHandle<()>) {
        self.cycles += 1;
        self.in_flight = Some(cycle);
    }

    /// Clears the finished cycle.
    pub fn complete(&mut self) {
        self.in_flight = None;
    }

    /// Disarms the timer and aborts the cycle in flight.
    pub fn stop(&mut self) {
        self.ticker = None;
        if let Some(cycle) = self.in_flight.take() {
            cycle.abort();
        }
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dormant_until_started_then_ticks_each_period() {
        let mut scheduler = SyncScheduler::new(Duration::from_secs(30));
        let idle = tokio::time::timeout(Duration::from_secs(120), scheduler.tick()).await;
        assert!(idle.is_err());

        scheduler.start();
        let started = Instant::now();
        scheduler.tick().await;
        assert!(started.elapsed() >= Duration::from_secs(30));
        scheduler.tick().await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_in_flight_cycle() {
        let mut scheduler = SyncScheduler::new(Duration::from_secs(30));
        scheduler.start();
        let cycle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        scheduler.track(cycle);
        assert!(scheduler.is_in_flight());
        assert_eq!(scheduler.cycles(), 1);

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(!scheduler.is_in_flight());
    }
}
