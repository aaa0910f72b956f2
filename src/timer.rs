//! Refresh Timer Module
//!
//! Decides when the next community background is due and arms a one-shot
//! timer for it.
//!
//! ## Timer Behavior
//! - Next refresh is due `wait_time` minutes after the last fetch
//! - A missing last-fetch timestamp means a refresh is due right now
//! - Long waits are slept in chunks of at most [`MAX_TIMER_DELAY`], recomputing
//!   the deadline after each chunk
//! - Rescheduling replaces the previous timer; only one is ever armed
//!
//! The deadline arithmetic is the pure function [`next_deadline`], so it can
//! be tested without sleeping.

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Longest single sleep the timer arms (matches a signed 32-bit millisecond interval).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// What to do when an armed timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The refresh is due: fetch
    Fetch,
    /// The delay was capped: compute the deadline again and keep waiting
    Reschedule,
}

/// Outcome of [`next_deadline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Deadline already passed
    FetchNow,
    /// Arm a one-shot timer for `delay`, then act on `then`
    Wait { delay: Duration, then: Expiry },
}

/// When the next refresh is due, or `None` if it is due immediately
/// because nothing was ever fetched.
pub fn due_time(last_fetched: Option<DateTime<Utc>>, wait_minutes: u32) -> Option<DateTime<Utc>> {
    last_fetched.map(|fetched| fetched + ChronoDuration::minutes(i64::from(wait_minutes)))
}

/// Computes the next refresh deadline relative to `now`.
pub fn next_deadline(
    last_fetched: Option<DateTime<Utc>>,
    wait_minutes: u32,
    now: DateTime<Utc>,
) -> Schedule {
    let Some(due) = due_time(last_fetched, wait_minutes) else {
        return Schedule::FetchNow;
    };

    // to_std() fails for negative durations, i.e. the deadline is in the past
    let remaining = match due.signed_duration_since(now).to_std() {
        Ok(d) if !d.is_zero() => d,
        _ => return Schedule::FetchNow,
    };

    if remaining > MAX_TIMER_DELAY {
        Schedule::Wait {
            delay: MAX_TIMER_DELAY,
            then: Expiry::Reschedule,
        }
    } else {
        Schedule::Wait {
            delay: remaining,
            then: Expiry::Fetch,
        }
    }
}

/// One-shot timer that delivers a message on a channel when the refresh is due.
#[derive(Debug, Default)]
pub struct RefreshTimer {
    /// Background task sleeping towards the deadline
    handle: Option<JoinHandle<()>>,
    /// Deadline of the armed timer
    next_run: Option<DateTime<Utc>>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any armed timer with one for the given fetch history.
    ///
    /// Returns `true` when the refresh is already due; nothing is armed in that
    /// case and the caller should fetch right away.
    pub fn schedule<T: Send + 'static>(
        &mut self,
        last_fetched: Option<DateTime<Utc>>,
        wait_minutes: u32,
        tx: UnboundedSender<T>,
        message: T,
    ) -> bool {
        self.cancel();

        if next_deadline(last_fetched, wait_minutes, Utc::now()) == Schedule::FetchNow {
            return true;
        }

        self.next_run = due_time(last_fetched, wait_minutes);
        tracing::info!(next = ?self.next_run, "community refresh scheduled");

        self.handle = Some(tokio::spawn(async move {
            loop {
                match next_deadline(last_fetched, wait_minutes, Utc::now()) {
                    Schedule::FetchNow => break,
                    Schedule::Wait { delay, then } => {
                        tokio::time::sleep(delay).await;
                        if then == Expiry::Fetch {
                            break;
                        }
                    }
                }
            }
            let _ = tx.send(message);
        }));

        false
    }

    /// Disarms the timer, if one is armed.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.next_run = None;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run
    }

    /// Get the next run time formatted for display (empty if nothing is armed)
    pub fn next_run_string(&self) -> String {
        match self.next_run() {
            Some(dt) if self.is_armed() => dt.with_timezone(&Local).format("%a %b %d %H:%M").to_string(),
            _ => String::new(),
        }
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: i64) -> ChronoDuration {
        ChronoDuration::minutes(m)
    }

    #[test]
    fn test_overdue_fetches_now() {
        let now = Utc::now();
        assert_eq!(next_deadline(Some(now - minutes(40)), 30, now), Schedule::FetchNow);
    }

    #[test]
    fn test_pending_waits_remaining_time() {
        let now = Utc::now();
        match next_deadline(Some(now - minutes(10)), 30, now) {
            Schedule::Wait { delay, then } => {
                assert_eq!(delay, Duration::from_secs(20 * 60));
                assert_eq!(then, Expiry::Fetch);
            }
            other => panic!("expected a wait, got {other:?}"),
        }
    }

    #[test]
    fn test_never_fetched_is_due() {
        assert_eq!(next_deadline(None, 30, Utc::now()), Schedule::FetchNow);
    }

    #[test]
    fn test_exactly_due_fetches_now() {
        let now = Utc::now();
        assert_eq!(next_deadline(Some(now - minutes(30)), 30, now), Schedule::FetchNow);
    }

    #[test]
    fn test_due_is_last_plus_wait() {
        let now = Utc::now();
        for wait in [0u32, 1, 30, 90, 1440] {
            for ago in [0i64, 5, 45, 2000] {
                let last = now - minutes(ago);
                let due = due_time(Some(last), wait).unwrap();
                assert_eq!(due, last + minutes(i64::from(wait)));

                let schedule = next_deadline(Some(last), wait, now);
                if due <= now {
                    assert_eq!(schedule, Schedule::FetchNow);
                } else {
                    assert!(matches!(schedule, Schedule::Wait { .. }));
                }
            }
        }
    }

    #[test]
    fn test_long_wait_is_capped() {
        let now = Utc::now();
        // 60 days is well past a 32-bit millisecond interval (~24.8 days)
        let schedule = next_deadline(Some(now), 60 * 24 * 60, now);
        assert_eq!(
            schedule,
            Schedule::Wait {
                delay: MAX_TIMER_DELAY,
                then: Expiry::Reschedule
            }
        );
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut timer = RefreshTimer::new();

        // Due 50ms from now
        let last = Utc::now() - minutes(30) + ChronoDuration::milliseconds(50);
        assert!(!timer.schedule(Some(last), 30, tx, "tick"));
        assert!(timer.next_run().is_some());

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got, Some("tick"));
    }

    #[tokio::test]
    async fn test_due_now_arms_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut timer = RefreshTimer::new();
        assert!(timer.schedule(None, 30, tx, ()));
        assert!(!timer.is_armed());
        assert!(timer.next_run_string().is_empty());
        // Sender was dropped without a message
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_previous() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut timer = RefreshTimer::new();

        let soon = Utc::now() - minutes(30) + ChronoDuration::milliseconds(50);
        timer.schedule(Some(soon), 30, tx.clone(), "first");
        // Replace with a far-away deadline before the first fires
        timer.schedule(Some(Utc::now()), 30, tx, "second");

        let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(got.is_err(), "replaced timer must not fire");
        assert!(timer.is_armed());
    }
}
