//! The orchestrator: ties address validation, token checking, rate limiting
//! and wallet I/O together into a single atomic claim operation.

use aes::Aes128;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::alert::AlertLatch;
use crate::base58::address_version;
use crate::clientaddr::{parse_client_addr, rl_key, InvalidClientAddress};
use crate::clock::SharedClock;
use crate::interfaces::{Alerter, Bank, BankError, ClaimError, FaucetDb};
use crate::rcdb::RCDB;
use crate::token::{check_token, gen_token, new_token_cipher};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub amount: f64,
    pub period: Duration,
}

/// Giveaway policy. Mirrors the upstream `FaucetConfig` field-for-field;
/// see DESIGN.md for the source of each threshold's meaning.
#[derive(Debug, Clone)]
pub struct FaucetConfig {
    pub amount: f64,
    pub fee: f64,
    pub min_amount: f64,
    pub stingy_amount: f64,
    pub low_balance: f64,
    pub ip_claim_interval: Duration,
    pub rate_limit: RateLimitConfig,
    pub token_key: Option<[u8; 16]>,
    pub address_versions: Vec<u32>,
}

/// Composition root: generic over the bank, persistence and alerting
/// collaborators so tests can supply in-memory fakes for all three.
pub struct Faucet<B, D, A> {
    bank: B,
    fdb: Option<D>,
    alerter: Option<A>,
    cfg: FaucetConfig,
    rcdb: RCDB,
    tc: Option<Aes128>,
    alert_latch: AlertLatch,
    clock: SharedClock,
}

impl<B, D, A> Faucet<B, D, A>
where
    B: Bank,
    D: FaucetDb,
    A: Alerter,
{
    /// Builds a faucet, replaying recent claim-log records (if `fdb` is
    /// supplied) into the rate-limit state so restarts don't reset a
    /// client's cooldown or the rolling rate-limit window.
    pub async fn new(
        cfg: FaucetConfig,
        bank: B,
        fdb: Option<D>,
        alerter: Option<A>,
        clock: SharedClock,
    ) -> Result<Self, crate::interfaces::StoreError> {
        let rcdb = RCDB::new(cfg.ip_claim_interval, cfg.rate_limit.period);
        let tc = cfg.token_key.as_ref().map(new_token_cipher);

        if let Some(db) = &fdb {
            let mut replay_window = Duration::zero();
            if replay_window < cfg.ip_claim_interval {
                replay_window = cfg.ip_claim_interval;
            }
            if replay_window < cfg.rate_limit.period {
                replay_window = cfg.rate_limit.period;
            }
            if replay_window >= Duration::seconds(1) {
                let now = clock.now();
                let mut iter = db.claims_since(now - replay_window).await?;

                // The cursor must be closed on every path, including one
                // where reading a record fails partway through.
                let mut records = Vec::new();
                let mut read_err = None;
                loop {
                    match iter.next().await {
                        Ok(Some(r)) => records.push((r.t, r.client.octets(), r.amount)),
                        Ok(None) => break,
                        Err(e) => {
                            read_err = Some(e);
                            break;
                        }
                    }
                }
                iter.close().await?;
                if let Some(e) = read_err {
                    return Err(e);
                }

                rcdb.add_from_log(records, now);
            }
        }

        Ok(Faucet {
            bank,
            fdb,
            alerter,
            cfg,
            rcdb,
            tc,
            alert_latch: AlertLatch::new(),
            clock,
        })
    }

    /// Recipient address versions this faucet will pay out to. Empty means
    /// any Base58Check-valid address is accepted.
    pub fn address_versions(&self) -> &[u32] {
        &self.cfg.address_versions
    }

    fn valid_recipient(&self, recipient: &str) -> bool {
        if self.cfg.address_versions.is_empty() {
            return true;
        }
        let version = address_version(recipient);
        version >= 0 && self.cfg.address_versions.iter().any(|&v| v as i32 == version)
    }

    async fn amount_and_balance(&self, cancel: &CancellationToken) -> Result<(f64, f64), ClaimError> {
        let balance = self
            .bank
            .balance(cancel)
            .await
            .map_err(|e| ClaimError::ServiceUnavailable(bank_error_source(e)))?;

        let rate_limited =
            self.cfg.rate_limit.amount > 0.0 && self.cfg.rate_limit.period >= Duration::seconds(1);
        let rolling_amount = if rate_limited {
            self.rcdb.period_total(self.clock.now())
        } else {
            0.0
        };

        let mut amount = balance - self.cfg.fee;
        if amount > self.cfg.stingy_amount
            && self.cfg.stingy_amount >= self.cfg.min_amount
            && amount < self.cfg.low_balance
        {
            amount = self.cfg.stingy_amount;
        }
        if amount > self.cfg.stingy_amount && rolling_amount > self.cfg.rate_limit.amount {
            amount = self.cfg.stingy_amount;
        }
        if amount > self.cfg.amount {
            amount = self.cfg.amount;
        }
        if amount < self.cfg.min_amount {
            amount = 0.0;
        }

        if let Some(alerter) = &self.alerter {
            if self.cfg.low_balance > 0.0 || rate_limited {
                self.alert_latch.check(
                    balance,
                    self.cfg.low_balance,
                    rolling_amount,
                    self.cfg.rate_limit.amount,
                    self.cfg.rate_limit.period,
                    alerter,
                );
            }
        }

        Ok((amount, balance))
    }

    /// Expected giveaway amount right now, for display before a claim.
    pub async fn amount(&self, cancel: &CancellationToken) -> Result<f64, ClaimError> {
        self.amount_and_balance(cancel).await.map(|(amount, _)| amount)
    }

    /// The per-client token, or `None` if this faucet doesn't require one.
    pub fn token(&self, client: &str) -> Result<Option<String>, InvalidClientAddress> {
        let Some(tc) = &self.tc else {
            return Ok(None);
        };
        let client_ip = parse_client_addr(client)?;
        let now_unix = self.clock.now().timestamp();
        Ok(Some(gen_token(&client_ip.octets(), tc, now_unix)))
    }

    /// Time after which `client` may claim again, or `None` if it may claim
    /// right now.
    pub fn wait_time(&self, client: &str) -> Result<Option<DateTime<Utc>>, InvalidClientAddress> {
        if self.cfg.ip_claim_interval < Duration::seconds(1) {
            return Ok(None);
        }
        let client_ip = parse_client_addr(client)?;
        let key = rl_key(client_ip);
        Ok(self.rcdb.check_interval(key, self.clock.now()))
    }

    /// Validates and services a claim. On success, funds have already been
    /// sent; a persistence failure logging the claim is never surfaced here
    /// (see DESIGN.md's "Persistence-logging error shadowing" resolution).
    pub async fn claim(
        &self,
        client: &str,
        recipient: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<(f64, String), ClaimError> {
        if cancel.is_cancelled() {
            return Err(ClaimError::Cancelled);
        }
        if !self.valid_recipient(recipient) {
            return Err(ClaimError::InvalidRecipient);
        }
        let client_ip = parse_client_addr(client)?;
        let client_bytes = client_ip.octets();

        if let Some(tc) = &self.tc {
            let now_unix = self.clock.now().timestamp();
            if token.is_empty() || !check_token(&client_bytes, token, tc, now_unix) {
                return Err(ClaimError::InvalidToken);
            }
        }

        let rate_limited = self.cfg.ip_claim_interval >= Duration::seconds(1);
        let key = rl_key(client_ip);
        let mut reservation: Vec<DateTime<Utc>> = Vec::new();
        if rate_limited {
            let now = self.clock.now();
            match self.rcdb.check_add_intervals(key, now) {
                // An empty reservation means `ip_claim_interval` was too
                // short to seed even the coarsest prefix on the ladder (e.g.
                // exactly one second); it carries no cooldown and must be
                // refused the same as `None`, not treated as "allowed".
                Some(ts) if !ts.is_empty() => reservation = ts,
                _ => {
                    let until = self.rcdb.check_interval(key, now).unwrap_or(now);
                    return Err(ClaimError::MustWait(until));
                }
            }
        }

        macro_rules! release_reservation {
            () => {
                if rate_limited && !reservation.is_empty() {
                    self.rcdb.del_intervals(key, &reservation);
                }
            };
        }

        let amount_and_balance_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                release_reservation!();
                return Err(ClaimError::Cancelled);
            }
            r = self.amount_and_balance(cancel) => r,
        };
        let (amount, balance) = match amount_and_balance_result {
            Ok(v) => v,
            Err(e) => {
                release_reservation!();
                return Err(e);
            }
        };
        if amount == 0.0 {
            release_reservation!();
            return Err(if balance < self.cfg.fee + self.cfg.min_amount {
                ClaimError::NoFunds
            } else {
                ClaimError::Paused
            });
        }

        let t1 = self.clock.now();
        // Once `send` is in flight it may have already committed at the
        // wallet even if this call is cancelled, so cancellation here must
        // not be allowed to make us skip inspecting its result: racing
        // would let us return `Cancelled` for a transfer that actually
        // went through. We only consult `cancel` before releasing the
        // reservation below, not to abandon the send itself.
        let send_result = self.bank.send(recipient, amount, cancel).await;
        let t2 = self.clock.now();

        let tx = match send_result {
            Ok(tx) if !tx.is_empty() => tx,
            Ok(empty_tx) => {
                release_reservation!();
                return Ok((amount, empty_tx));
            }
            Err(BankError::InvalidRecipient) => {
                release_reservation!();
                return Err(ClaimError::InvalidRecipient);
            }
            Err(BankError::Other(inner)) => {
                release_reservation!();
                if cancel.is_cancelled() {
                    return Err(ClaimError::Cancelled);
                }
                return Err(ClaimError::Send(inner));
            }
        };

        // tx is non-empty past this point: the reservation is consumed by
        // the claim and must never be released, even if logging fails.
        let mid = t1 + (t2 - t1) / 2;
        self.rcdb.add_claim(self.clock.now(), mid, amount);
        if let Some(db) = &self.fdb {
            match hex::decode(&tx) {
                Ok(raw_tx) => {
                    if let Err(e) = db
                        .log_claim(mid, client_ip, recipient, amount, &raw_tx, cancel)
                        .await
                    {
                        tracing::error!(error = %e, tx = %tx, "failed to log claim");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, tx = %tx, "failed to decode transaction identifier");
                }
            }
        }
        Ok((amount, tx))
    }
}

fn bank_error_source(e: BankError) -> crate::interfaces::BoxError {
    Box::new(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::interfaces::{ClaimLogIter, StoreError, VecClaimLogIter};
    use std::sync::Mutex;

    struct FakeBank {
        balance: f64,
    }

    #[async_trait::async_trait]
    impl Bank for FakeBank {
        async fn balance(&self, _cancel: &CancellationToken) -> Result<f64, BankError> {
            Ok(self.balance)
        }

        async fn send(
            &self,
            _recipient: &str,
            _amount: f64,
            _cancel: &CancellationToken,
        ) -> Result<String, BankError> {
            Ok("deadbeef".to_string())
        }
    }

    #[derive(Default)]
    struct FakeDb {
        logged: Mutex<Vec<(f64, String)>>,
    }

    #[async_trait::async_trait]
    impl FaucetDb for FakeDb {
        async fn claims_since(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Box<dyn ClaimLogIter>, StoreError> {
            Ok(Box::new(VecClaimLogIter::new(Vec::new())))
        }

        async fn log_claim(
            &self,
            _t: DateTime<Utc>,
            _client: std::net::Ipv6Addr,
            recipient: &str,
            amount: f64,
            _tx: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), StoreError> {
            self.logged
                .lock()
                .unwrap()
                .push((amount, recipient.to_string()));
            Ok(())
        }
    }

    struct NoopAlerter;

    impl Alerter for NoopAlerter {
        fn balance_alert(&self, _balance: f64) {}
        fn rate_alert(&self, _amount: f64, _period: Duration) {}
    }

    fn test_config() -> FaucetConfig {
        FaucetConfig {
            amount: 10.0,
            fee: 1.0,
            min_amount: 2.0,
            stingy_amount: 0.0,
            low_balance: 0.0,
            ip_claim_interval: Duration::hours(1),
            rate_limit: RateLimitConfig {
                amount: 0.0,
                period: Duration::zero(),
            },
            token_key: None,
            address_versions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn s6_claim_then_must_wait() {
        let clock: SharedClock = std::sync::Arc::new(FakeClock::new(Utc::now()));
        let faucet = Faucet::new(
            test_config(),
            FakeBank { balance: 5.0 },
            Some(FakeDb::default()),
            Some(NoopAlerter),
            clock.clone(),
        )
        .await
        .unwrap();

        let (amount, tx) = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(amount, 4.0);
        assert_eq!(tx, "deadbeef");

        match faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
        {
            Err(ClaimError::MustWait(_)) => {}
            other => panic!("expected MustWait, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_funds_below_fee_plus_min() {
        let clock: SharedClock = std::sync::Arc::new(FakeClock::new(Utc::now()));
        let faucet = Faucet::new(
            test_config(),
            FakeBank { balance: 2.0 }, // 2 - 1 fee = 1, below min_amount 2 -> amount forced to 0
            None::<FakeDb>,
            None::<NoopAlerter>,
            clock,
        )
        .await
        .unwrap();

        let err = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::NoFunds));
    }

    #[tokio::test]
    async fn invalid_recipient_is_rejected_before_any_io() {
        let clock: SharedClock = std::sync::Arc::new(FakeClock::new(Utc::now()));
        let mut cfg = test_config();
        cfg.address_versions = vec![111]; // testnet P2PKH only
        let faucet = Faucet::new(
            cfg,
            FakeBank { balance: 5.0 },
            None::<FakeDb>,
            None::<NoopAlerter>,
            clock,
        )
        .await
        .unwrap();

        let err = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::InvalidRecipient));
    }

    #[tokio::test]
    async fn failed_send_releases_the_reservation() {
        struct FailingBank;
        #[async_trait::async_trait]
        impl Bank for FailingBank {
            async fn balance(&self, _cancel: &CancellationToken) -> Result<f64, BankError> {
                Ok(5.0)
            }
            async fn send(
                &self,
                _recipient: &str,
                _amount: f64,
                _cancel: &CancellationToken,
            ) -> Result<String, BankError> {
                Err(BankError::Other("wallet offline".into()))
            }
        }

        let clock: SharedClock = std::sync::Arc::new(FakeClock::new(Utc::now()));
        let faucet = Faucet::new(
            test_config(),
            FailingBank,
            None::<FakeDb>,
            None::<NoopAlerter>,
            clock,
        )
        .await
        .unwrap();

        let err = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Send(_)));

        // The cooldown reservation from the failed attempt must have been
        // released, so an immediate retry is allowed to proceed to the bank
        // again rather than being refused with MustWait.
        let err2 = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err2, ClaimError::Send(_)));
    }

    #[tokio::test]
    async fn cancelling_before_send_releases_the_reservation_and_reports_cancelled() {
        struct StallingBank;
        #[async_trait::async_trait]
        impl Bank for StallingBank {
            async fn balance(&self, _cancel: &CancellationToken) -> Result<f64, BankError> {
                Ok(5.0)
            }
            async fn send(
                &self,
                _recipient: &str,
                _amount: f64,
                _cancel: &CancellationToken,
            ) -> Result<String, BankError> {
                panic!("send must not be reached once cancellation has already fired");
            }
        }

        let clock: SharedClock = std::sync::Arc::new(FakeClock::new(Utc::now()));
        let faucet = Faucet::new(
            test_config(),
            StallingBank,
            None::<FakeDb>,
            None::<NoopAlerter>,
            clock,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::Cancelled));

        // A cancelled request never takes a reservation in the first place,
        // so a fresh, non-cancelled claim right after is allowed through.
        let (amount, tx) = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(amount, 4.0);
        assert_eq!(tx, "deadbeef");
    }

    #[tokio::test]
    async fn cancelling_after_successful_send_still_commits() {
        struct OneShotBank;
        #[async_trait::async_trait]
        impl Bank for OneShotBank {
            async fn balance(&self, _cancel: &CancellationToken) -> Result<f64, BankError> {
                Ok(5.0)
            }
            async fn send(
                &self,
                _recipient: &str,
                _amount: f64,
                cancel: &CancellationToken,
            ) -> Result<String, BankError> {
                // The wallet commits the transfer, then the caller's request
                // is cancelled in the window between the send completing and
                // `claim` returning.
                cancel.cancel();
                Ok("deadbeef".to_string())
            }
        }

        let clock: SharedClock = std::sync::Arc::new(FakeClock::new(Utc::now()));
        let faucet = Faucet::new(
            test_config(),
            OneShotBank,
            Some(FakeDb::default()),
            None::<NoopAlerter>,
            clock,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let (amount, tx) = faucet
            .claim(
                "203.0.113.9:1234",
                "1111111111111111111114oLvT2",
                "",
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(amount, 4.0);
        assert_eq!(tx, "deadbeef");
    }
}
