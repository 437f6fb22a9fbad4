//! Deadline timer driving outbound flushes.
//!
//! Plays the role of a kernel timer descriptor in a readiness loop: the
//! worker `select!`s on [`FlushTimer::expired`] next to its socket, while
//! the peer worker re-arms the timer from `transmit_frame`. Re-arms are
//! pushed through a [`Notify`] so a pending wait always picks up the newest
//! deadline, including one that moved *earlier*; the adaptive per-ID
//! flush policy depends on that.
//!
//! Semantics follow the timer-descriptor contract: `adjust` never disables
//! (a zero value is clamped to one microsecond), `fire` forces a one-shot
//! expiry while keeping the stored interval, `enable` re-arms to the
//! interval, and an expiry re-arms periodically, reporting how many
//! expirations elapsed.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Smallest representable arming value.
const MIN_ARM: Duration = Duration::from_micros(1);

struct TimerState {
    interval: Duration,
    deadline: Option<Instant>,
}

/// A re-armable deadline timer whose expiry is awaitable in `select!`.
pub struct FlushTimer {
    state: Mutex<TimerState>,
    changed: Notify,
}

impl FlushTimer {
    /// Create a disabled timer with the given re-arm interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(TimerState {
                interval: interval.max(MIN_ARM),
                deadline: None,
            }),
            changed: Notify::new(),
        }
    }

    /// Set the interval and arm the timer to expire after `value`. A zero
    /// `value` (or interval) is clamped to one microsecond; `adjust` never
    /// disables the timer.
    pub fn adjust(&self, interval: Duration, value: Duration) {
        {
            let mut state = self.state.lock().expect("timer lock poisoned");
            state.interval = interval.max(MIN_ARM);
            state.deadline = Some(Instant::now() + value.max(MIN_ARM));
        }
        self.changed.notify_one();
    }

    /// Force an expiry one microsecond from now, keeping the interval.
    pub fn fire(&self) {
        {
            let mut state = self.state.lock().expect("timer lock poisoned");
            state.deadline = Some(Instant::now() + MIN_ARM);
        }
        self.changed.notify_one();
    }

    /// Disarm the timer. [`FlushTimer::expired`] will not complete until it
    /// is armed again.
    pub fn disable(&self) {
        {
            let mut state = self.state.lock().expect("timer lock poisoned");
            state.deadline = None;
        }
        self.changed.notify_one();
    }

    /// Re-arm the timer to expire one full interval from now.
    pub fn enable(&self) {
        {
            let mut state = self.state.lock().expect("timer lock poisoned");
            state.deadline = Some(Instant::now() + state.interval);
        }
        self.changed.notify_one();
    }

    /// Whether the timer is armed.
    pub fn is_enabled(&self) -> bool {
        self.state
            .lock()
            .expect("timer lock poisoned")
            .deadline
            .is_some()
    }

    /// Time until the pending expiry; zero when disabled or already due.
    pub fn remaining(&self) -> Duration {
        let state = self.state.lock().expect("timer lock poisoned");
        match state.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// The stored re-arm interval.
    pub fn interval(&self) -> Duration {
        self.state.lock().expect("timer lock poisoned").interval
    }

    /// Wait for the next expiry and return the number of elapsed
    /// expirations (usually 1; more if the loop lagged behind the
    /// interval). Re-arms periodically. Pends forever while the timer is
    /// disabled; cancel-safe, so it can sit in a `select!` arm.
    pub async fn expired(&self) -> u64 {
        loop {
            let deadline = {
                self.state.lock().expect("timer lock poisoned").deadline
            };
            let Some(deadline) = deadline else {
                self.changed.notified().await;
                continue;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let mut state = self.state.lock().expect("timer lock poisoned");
                    match state.deadline {
                        Some(current) if current <= Instant::now() => {
                            let now = Instant::now();
                            let lag = now.saturating_duration_since(current);
                            let missed = (lag.as_micros() / state.interval.as_micros()) as u64;
                            let n = (missed + 1).min(u32::MAX as u64);
                            state.deadline = Some(current + state.interval * n as u32);
                            return n;
                        }
                        // Re-armed to a later deadline or disabled while we
                        // slept; start over.
                        _ => continue,
                    }
                }
                _ = self.changed.notified() => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{advance, timeout};

    const MS: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_value() {
        let timer = FlushTimer::new(Duration::from_millis(100));
        timer.adjust(Duration::from_millis(100), Duration::from_millis(10));

        let expirations = timeout(Duration::from_millis(11), timer.expired())
            .await
            .unwrap();
        assert_eq!(expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timer_pends() {
        let timer = FlushTimer::new(Duration::from_millis(5));
        assert!(!timer.is_enabled());
        assert!(timeout(Duration::from_millis(50), timer.expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_expires_immediately() {
        let timer = FlushTimer::new(Duration::from_secs(100));
        timer.adjust(Duration::from_secs(100), Duration::from_secs(100));
        timer.fire();
        timeout(MS, timer.expired()).await.unwrap();
        // The interval survives a fire.
        assert_eq!(timer.interval(), Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_wakes_pending_wait() {
        let timer = Arc::new(FlushTimer::new(Duration::from_secs(100)));
        timer.enable();

        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.expired().await })
        };
        tokio::task::yield_now().await;
        timer.fire();
        let expirations = timeout(MS, waiter).await.unwrap().unwrap();
        assert_eq!(expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_earlier_shortens_pending_wait() {
        let timer = Arc::new(FlushTimer::new(Duration::from_millis(100)));
        timer.adjust(Duration::from_millis(100), Duration::from_millis(80));

        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.expired().await })
        };
        tokio::task::yield_now().await;

        // A stricter per-ID deadline arrives.
        timer.adjust(Duration::from_millis(100), Duration::from_millis(5));
        timeout(Duration::from_millis(6), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_pending_expiry() {
        let timer = FlushTimer::new(Duration::from_millis(10));
        timer.enable();
        timer.disable();
        assert!(!timer.is_enabled());
        assert_eq!(timer.remaining(), Duration::ZERO);
        assert!(timeout(Duration::from_millis(100), timer.expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_rearms_to_interval() {
        let timer = FlushTimer::new(Duration::from_millis(40));
        timer.enable();
        assert!(timer.is_enabled());
        assert!(timer.remaining() <= Duration::from_millis(40));
        assert!(timer.remaining() > Duration::from_millis(39));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_rearm() {
        let timer = FlushTimer::new(Duration::from_millis(10));
        timer.adjust(Duration::from_millis(10), Duration::from_millis(10));

        for _ in 0..3 {
            let n = timeout(Duration::from_millis(11), timer.expired())
                .await
                .unwrap();
            assert_eq!(n, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_expirations_counted() {
        let timer = FlushTimer::new(Duration::from_millis(10));
        timer.adjust(Duration::from_millis(10), Duration::from_millis(10));

        advance(Duration::from_millis(35)).await;
        let n = timer.expired().await;
        assert_eq!(n, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_zero_value_means_one_microsecond() {
        let timer = FlushTimer::new(Duration::from_millis(10));
        timer.adjust(Duration::ZERO, Duration::ZERO);
        assert!(timer.is_enabled());
        timeout(MS, timer.expired()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_tracks_deadline() {
        let timer = FlushTimer::new(Duration::from_millis(100));
        timer.adjust(Duration::from_millis(100), Duration::from_millis(80));
        advance(Duration::from_millis(30)).await;
        let remaining = timer.remaining();
        assert!(remaining <= Duration::from_millis(50));
        assert!(remaining > Duration::from_millis(49));
    }
}
