use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Fixed-cadence tick source. The first tick fires immediately, later ones at
/// `start + n * interval` regardless of how long each tick's work took.
pub struct Scheduler {
    interval: Duration,
    next: Instant,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Waits for the next tick. Cancel safe: dropping the future before it
    /// completes leaves the schedule untouched.
    pub async fn tick(&mut self) {
        sleep_until(self.next).await;
        self.next += self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_on_fixed_cadence() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new(Duration::from_secs(1));

        scheduler.tick().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        scheduler.tick().await;
        scheduler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tick_does_not_shift_schedule() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.tick().await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1500));

        scheduler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
