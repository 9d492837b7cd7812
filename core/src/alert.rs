//! Edge-triggered alert debouncing: fires at most once per transition from
//! a healthy state to an unhealthy one, not once per observation.

use std::sync::Mutex;

use chrono::Duration;

use crate::interfaces::Alerter;

struct LatchState {
    bal_ok: bool,
    rate_ok: bool,
}

/// Tracks whether the balance-low and rate-limit conditions were last seen
/// healthy, so repeated unhealthy observations don't re-fire an alert.
///
/// Both latches start "unhealthy" (mirroring a zero-valued bool): if the
/// very first observation after startup is already over a threshold, no
/// alert fires for it, since there is no known-good baseline to transition
/// from. The next healthy observation re-arms the latch.
pub struct AlertLatch {
    state: Mutex<LatchState>,
}

impl AlertLatch {
    pub fn new() -> Self {
        AlertLatch {
            state: Mutex::new(LatchState {
                bal_ok: false,
                rate_ok: false,
            }),
        }
    }

    /// Evaluates both conditions against their thresholds and notifies
    /// `alerter` for whichever one just transitioned to unhealthy.
    pub fn check(
        &self,
        balance: f64,
        low_balance: f64,
        rate_amount: f64,
        rate_limit_amount: f64,
        rate_limit_period: Duration,
        alerter: &dyn Alerter,
    ) {
        let mut state = self.state.lock().expect("alert latch mutex poisoned");
        if balance <= low_balance {
            if state.bal_ok {
                state.bal_ok = false;
                alerter.balance_alert(balance);
            }
        } else {
            state.bal_ok = true;
        }
        if rate_amount > rate_limit_amount {
            if state.rate_ok {
                state.rate_ok = false;
                alerter.rate_alert(rate_amount, rate_limit_period);
            }
        } else {
            state.rate_ok = true;
        }
    }
}

impl Default for AlertLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAlerter {
        balance_calls: AtomicUsize,
        rate_calls: AtomicUsize,
    }

    impl Alerter for CountingAlerter {
        fn balance_alert(&self, _balance: f64) {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn rate_alert(&self, _amount: f64, _period: Duration) {
            self.rate_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn already_unhealthy_at_startup_does_not_alert() {
        let latch = AlertLatch::new();
        let alerter = CountingAlerter::default();
        latch.check(1.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter);
        assert_eq!(alerter.balance_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fires_once_on_transition_then_stays_quiet() {
        let latch = AlertLatch::new();
        let alerter = CountingAlerter::default();
        latch.check(100.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter); // healthy, arms latch
        latch.check(1.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter); // drops -> fires
        latch.check(1.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter); // still low -> silent
        assert_eq!(alerter.balance_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearms_after_recovery() {
        let latch = AlertLatch::new();
        let alerter = CountingAlerter::default();
        latch.check(100.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter);
        latch.check(1.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter);
        latch.check(100.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter); // recovers
        latch.check(1.0, 10.0, 0.0, 100.0, Duration::hours(1), &alerter); // fires again
        assert_eq!(alerter.balance_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rate_alert_is_independent_of_balance_alert() {
        let latch = AlertLatch::new();
        let alerter = CountingAlerter::default();
        latch.check(100.0, 10.0, 200.0, 100.0, Duration::hours(1), &alerter);
        assert_eq!(alerter.rate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(alerter.balance_calls.load(Ordering::SeqCst), 0);
    }
}
