//! Scheduling decisions
//!
//! All timing rules of the sync loop live here as plain functions over
//! [`SchedulerState`] so they can be exercised without sockets or sleeps.
//! The daemon feeds in the current instant and acts on the returned
//! decision.

use std::time::{Duration, Instant};

/// Minimum time between two synchronizations
pub const SYNC_DEBOUNCE: Duration = Duration::from_secs(30);

/// Longest delay a deadline is ever pushed out by
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn after(now: Instant, delay: Duration) -> Instant {
    now + delay.min(MAX_DELAY)
}

/// Retry delay after `consecutive_errors` failures, in seconds
///
/// Fewer than 3 failures wait a minute, fewer than 6 wait five minutes,
/// anything beyond waits an hour.
pub fn on_error_wait_secs(consecutive_errors: u32) -> u64 {
    if consecutive_errors < 3 {
        return 60;
    }
    if consecutive_errors < 6 {
        return 5 * 60;
    }
    60 * 60
}

/// What to do after a failed iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureAction {
    /// Failures in a row, including this one
    pub consecutive_errors: u32,
    /// Whether an alert must go out for this failure
    pub alert: bool,
    /// How long to sleep before the next iteration
    pub backoff: Duration,
}

/// Outcome of waking up in the callback wait loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeDecision {
    /// Registration expired; leave the wait and register again
    Refresh,
    /// Run a synchronization now
    Sync,
    /// A sync was wanted but came too soon after the last one
    Deferred { until: Instant },
    /// Nothing to do; keep waiting
    Idle,
}

/// Mutable state of the scheduling loop
#[derive(Clone, Debug)]
pub struct SchedulerState {
    /// When the last successful synchronization finished
    pub last_sync: Option<Instant>,
    /// When the next synchronization is due
    pub next_sync: Instant,
    /// When the callback registration must be renewed
    pub next_refresh: Option<Instant>,
    /// Failed iterations since the last success
    pub consecutive_errors: u32,
}

impl SchedulerState {
    /// Fresh state; the first iteration syncs immediately
    pub fn new(now: Instant) -> Self {
        Self {
            last_sync: None,
            next_sync: now,
            next_refresh: None,
            consecutive_errors: 0,
        }
    }

    /// Whether the timer demands a sync
    pub fn sync_due(&self, now: Instant) -> bool {
        self.next_sync <= now
    }

    /// A synchronization completed at `now`; the next one is `period` away
    pub fn record_sync(&mut self, now: Instant, period: Duration) {
        self.last_sync = Some(now);
        self.next_sync = after(now, period);
    }

    /// Enter the callback wait with fresh deadlines
    pub fn begin_wait(&mut self, now: Instant, interval: Duration, refresh: Duration) {
        self.next_sync = after(now, interval);
        self.next_refresh = Some(after(now, refresh));
    }

    /// Time until the timer sync is due
    pub fn until_sync(&self, now: Instant) -> Duration {
        self.next_sync.saturating_duration_since(now)
    }

    /// Accept timeout: time until the earlier of next sync and refresh
    pub fn wait_timeout(&self, now: Instant) -> Duration {
        let deadline = match self.next_refresh {
            Some(refresh) => self.next_sync.min(refresh),
            None => self.next_sync,
        };
        deadline.saturating_duration_since(now)
    }

    /// Decide what a wake-up at `now` means
    ///
    /// `triggered` is true when a trusted callback arrived. A trigger that
    /// coincides with the refresh deadline is not lost: the next sync is
    /// made due immediately so the following iteration picks it up.
    ///
    /// On [`WakeDecision::Sync`] the sync is left due until
    /// [`record_sync`](Self::record_sync), so a failed sync is retried by
    /// the next iteration.
    pub fn after_wake(&mut self, now: Instant, triggered: bool) -> WakeDecision {
        if self.next_refresh.is_some_and(|refresh| refresh <= now) {
            if triggered {
                self.next_sync = now;
            }
            return WakeDecision::Refresh;
        }

        if !triggered && now < self.next_sync {
            return WakeDecision::Idle;
        }

        if let Some(last) = self.last_sync {
            let earliest = last + SYNC_DEBOUNCE;
            if now < earliest {
                self.next_sync = earliest;
                return WakeDecision::Deferred { until: earliest };
            }
        }
        self.next_sync = self.next_sync.min(now);
        WakeDecision::Sync
    }

    /// Count a failed iteration
    pub fn record_failure(&mut self, mail_after_errors: u32) -> FailureAction {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        FailureAction {
            consecutive_errors: self.consecutive_errors,
            alert: self.consecutive_errors >= mail_after_errors,
            backoff: Duration::from_secs(on_error_wait_secs(self.consecutive_errors)),
        }
    }

    /// A full iteration succeeded
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }
}

/// Human readable duration, e.g. `4h 0m 12s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_backoff_schedule() {
        for n in 0..3 {
            assert_eq!(on_error_wait_secs(n), 60);
        }
        for n in 3..6 {
            assert_eq!(on_error_wait_secs(n), 300);
        }
        assert_eq!(on_error_wait_secs(6), 3600);
        assert_eq!(on_error_wait_secs(100), 3600);
    }

    #[test]
    fn test_initial_sync_is_due() {
        let now = Instant::now();
        let state = SchedulerState::new(now);
        assert!(state.sync_due(now));
    }

    #[test]
    fn test_record_sync_advances() {
        let now = Instant::now();
        let mut state = SchedulerState::new(now);
        state.record_sync(now, HOUR);

        assert_eq!(state.last_sync, Some(now));
        assert!(!state.sync_due(now + Duration::from_secs(59 * 60)));
        assert!(state.sync_due(now + HOUR));
        assert_eq!(state.until_sync(now), HOUR);
    }

    #[test]
    fn test_wait_timeout_uses_earlier_deadline() {
        let now = Instant::now();
        let mut state = SchedulerState::new(now);
        state.begin_wait(now, 4 * HOUR, 8 * HOUR);
        assert_eq!(state.wait_timeout(now), 4 * HOUR);

        state.begin_wait(now, 8 * HOUR, 2 * HOUR);
        assert_eq!(state.wait_timeout(now), 2 * HOUR);

        assert_eq!(state.wait_timeout(now + 3 * HOUR), Duration::ZERO);
    }

    #[test]
    fn test_callback_after_debounce_syncs() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.record_sync(start, HOUR);
        state.begin_wait(start, 4 * HOUR, 8 * HOUR);

        let now = start + Duration::from_secs(31);
        assert_eq!(state.after_wake(now, true), WakeDecision::Sync);
    }

    #[test]
    fn test_callback_within_debounce_is_deferred() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.record_sync(start, HOUR);
        state.begin_wait(start, 4 * HOUR, 8 * HOUR);

        let now = start + Duration::from_secs(10);
        let expected = start + SYNC_DEBOUNCE;
        assert_eq!(
            state.after_wake(now, true),
            WakeDecision::Deferred { until: expected }
        );
        assert_eq!(state.next_sync, expected);

        // The timer then fires at last_sync + 30s
        assert_eq!(state.wait_timeout(now), Duration::from_secs(20));
        assert_eq!(state.after_wake(expected, false), WakeDecision::Sync);
    }

    #[test]
    fn test_triggered_sync_stays_due_until_recorded() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.record_sync(start, HOUR);
        state.begin_wait(start, 4 * HOUR, 8 * HOUR);

        let now = start + Duration::from_secs(31);
        assert_eq!(state.after_wake(now, true), WakeDecision::Sync);
        // Sync failed: nothing recorded, the next iteration must still sync
        assert!(state.sync_due(now));

        state.record_sync(now, 4 * HOUR);
        assert!(!state.sync_due(now));
    }

    #[test]
    fn test_huge_periods_do_not_overflow() {
        let now = Instant::now();
        let mut state = SchedulerState::new(now);
        state.record_sync(now, Duration::MAX);
        assert_eq!(state.until_sync(now), MAX_DELAY);

        state.begin_wait(now, Duration::MAX, Duration::MAX);
        assert_eq!(state.wait_timeout(now), MAX_DELAY);
    }

    #[test]
    fn test_timeout_without_deadline_is_idle() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.record_sync(start, HOUR);
        state.begin_wait(start, 4 * HOUR, 8 * HOUR);

        assert_eq!(state.after_wake(start + HOUR, false), WakeDecision::Idle);
    }

    #[test]
    fn test_timer_sync_in_wait() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.record_sync(start, HOUR);
        state.begin_wait(start, 4 * HOUR, 8 * HOUR);

        assert_eq!(state.after_wake(start + 4 * HOUR, false), WakeDecision::Sync);
    }

    #[test]
    fn test_refresh_wins() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.record_sync(start, HOUR);
        state.begin_wait(start, 8 * HOUR, 8 * HOUR);

        let now = start + 8 * HOUR;
        assert_eq!(state.after_wake(now, false), WakeDecision::Refresh);
        assert!(!state.sync_due(start + 7 * HOUR));
    }

    #[test]
    fn test_trigger_at_refresh_is_kept() {
        let start = Instant::now();
        let mut state = SchedulerState::new(start);
        state.begin_wait(start, 8 * HOUR, 2 * HOUR);

        let now = start + 2 * HOUR;
        assert_eq!(state.after_wake(now, true), WakeDecision::Refresh);
        assert!(state.sync_due(now));
    }

    #[test]
    fn test_error_escalation() {
        let mut state = SchedulerState::new(Instant::now());
        let alerts: Vec<bool> = (0..7).map(|_| state.record_failure(5).alert).collect();
        assert_eq!(alerts, vec![false, false, false, false, true, true, true]);
        assert_eq!(state.consecutive_errors, 7);

        state.record_success();
        assert_eq!(state.consecutive_errors, 0);
        assert!(!state.record_failure(5).alert);
    }

    #[test]
    fn test_failure_backoff_follows_count() {
        let mut state = SchedulerState::new(Instant::now());
        let backoffs: Vec<u64> = (0..7)
            .map(|_| state.record_failure(5).backoff.as_secs())
            .collect();
        assert_eq!(backoffs, vec![60, 60, 300, 300, 300, 3600, 3600]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(4 * HOUR + Duration::from_secs(12)), "4h 0m 12s");
    }
}
