//! Dispatches alerts by invoking an external program, mirroring the
//! upstream `exalert` package: `program balance <amount>` and
//! `program rate <amount> <period_seconds>`.

use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::Duration;
use faucet_core::Alerter;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExAlerterConfig {
    #[serde(default)]
    pub alert_program: String,
}

impl ExAlerterConfig {
    pub fn configured(&self) -> bool {
        !self.alert_program.is_empty()
    }
}

struct State {
    /// Rate alerts are suppressed until this deadline, distinct from (and in
    /// addition to) the edge-triggered latch in `core::alert`: once a rate
    /// alert program run succeeds, further rate alerts of any rate are
    /// ignored until a full period has passed with no further invocations.
    rate_deadline: Option<Instant>,
}

/// Invokes an external program to deliver balance and rate alerts.
/// [`Alerter`] is synchronous and must not block the caller, so both
/// methods spawn the subprocess onto the current Tokio runtime rather than
/// awaiting it inline.
pub struct ExAlerter {
    program: String,
    state: Arc<Mutex<State>>,
}

impl ExAlerter {
    pub fn new(cfg: &ExAlerterConfig) -> Self {
        ExAlerter {
            program: cfg.alert_program.clone(),
            state: Arc::new(Mutex::new(State {
                rate_deadline: None,
            })),
        }
    }
}

impl Alerter for ExAlerter {
    fn balance_alert(&self, balance: f64) {
        let program = self.program.clone();
        tokio::spawn(async move {
            let arg = format_amount(balance);
            let status = Command::new(&program).arg("balance").arg(&arg).status().await;
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => tracing::warn!(code = ?s.code(), balance, "balance alert program exited non-zero"),
                Err(e) => tracing::warn!(error = %e, balance, "failed to send balance alert"),
            }
        });
    }

    fn rate_alert(&self, amount: f64, period: Duration) {
        let std_period = period.to_std().unwrap_or(StdDuration::ZERO);
        let now = Instant::now();
        let next_deadline = now + std_period;

        {
            let mut state = self.state.lock().expect("alerter state poisoned");
            if let Some(deadline) = state.rate_deadline {
                if now < deadline {
                    if next_deadline > deadline {
                        state.rate_deadline = Some(next_deadline);
                    }
                    return;
                }
            }
        }

        let program = self.program.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let amount_arg = format_amount(amount);
            let period_arg = std_period.as_secs().to_string();
            let status = Command::new(&program)
                .arg("rate")
                .arg(&amount_arg)
                .arg(&period_arg)
                .status()
                .await;
            match status {
                Ok(s) if s.success() => {
                    state.lock().expect("alerter state poisoned").rate_deadline = Some(next_deadline);
                }
                Ok(s) => {
                    tracing::warn!(code = ?s.code(), amount, "rate alert program exited non-zero")
                }
                Err(e) => tracing::warn!(error = %e, amount, "failed to send rate alert"),
            }
        });
    }
}

fn format_amount(amount: f64) -> String {
    let s = format!("{amount}");
    if s == "-0" {
        "0".to_string()
    } else {
        s
    }
}
