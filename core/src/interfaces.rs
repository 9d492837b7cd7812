//! The collaborator traits the orchestrator depends on, and the error
//! taxonomy its operations report.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::net::Ipv6Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clientaddr::InvalidClientAddress;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error surfaced by a [`Bank`] implementation.
#[derive(Debug, Error)]
pub enum BankError {
    /// The wallet itself rejected the recipient address (distinct from a
    /// local pre-send validation failure, which never reaches the bank).
    #[error("invalid recipient address")]
    InvalidRecipient,
    #[error(transparent)]
    Other(#[from] BoxError),
}

/// Error surfaced while persisting or reading the claim log.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct StoreError(#[from] BoxError);

/// Provides funds for the faucet to give away.
///
/// Both methods take a cancellation token that a caller may trip while the
/// call is in flight; an implementation is expected to race its I/O against
/// `cancel.cancelled()` and give up promptly rather than ignore it. Honoring
/// it is advisory to the bank (a partially-submitted send should still be
/// reported truthfully), but `Faucet::claim` relies on a responsive
/// implementation to bound how long a cancelled request holds a rate-limit
/// reservation.
#[async_trait]
pub trait Bank: Send + Sync {
    /// Balance available for giveaway.
    async fn balance(&self, cancel: &CancellationToken) -> Result<f64, BankError>;

    /// Sends coins to `recipient`, returning the transaction identifier.
    async fn send(
        &self,
        recipient: &str,
        amount: f64,
        cancel: &CancellationToken,
    ) -> Result<String, BankError>;
}

/// A single persisted claim-log record, as replayed at startup or read back
/// through a [`ClaimLogIter`].
#[derive(Debug, Clone, Copy)]
pub struct ClaimLogRecord {
    pub t: DateTime<Utc>,
    pub client: Ipv6Addr,
    pub amount: f64,
}

/// A scoped, async cursor over claim-log records returned by
/// [`FaucetDb::claims_since`]. Mirrors the upstream `ClaimLogIter`
/// interface's `Next`/`Get`/`Close`: records are read one at a time via
/// [`next`](ClaimLogIter::next), and the underlying resource (a database
/// connection, in `faucetd::db`) is released deterministically via
/// [`close`](ClaimLogIter::close) rather than left to `Drop` — closing is
/// itself an async operation, and the caller must close the iterator on
/// every path, including an error partway through iteration.
#[async_trait]
pub trait ClaimLogIter: Send {
    /// Advances the cursor, returning the next record or `None` once
    /// exhausted.
    async fn next(&mut self) -> Result<Option<ClaimLogRecord>, StoreError>;

    /// Releases the underlying resource. Must be called exactly once, after
    /// the caller is done reading (successfully or not).
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// An in-memory [`ClaimLogIter`] over a fixed set of records, with nothing
/// to release on `close`. Used by fakes in tests and by any `FaucetDb` whose
/// storage is already fully materialized.
pub struct VecClaimLogIter(VecDeque<ClaimLogRecord>);

impl VecClaimLogIter {
    pub fn new(records: Vec<ClaimLogRecord>) -> Self {
        VecClaimLogIter(records.into())
    }
}

#[async_trait]
impl ClaimLogIter for VecClaimLogIter {
    async fn next(&mut self) -> Result<Option<ClaimLogRecord>, StoreError> {
        Ok(self.0.pop_front())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Stores persistent data for the faucet.
#[async_trait]
pub trait FaucetDb: Send + Sync {
    /// Returns a cursor over all claim records at or after `since`, used to
    /// rebuild in-memory rate-limit state on startup. The caller owns the
    /// cursor's lifetime and must close it (see [`ClaimLogIter`]).
    async fn claims_since(&self, since: DateTime<Utc>) -> Result<Box<dyn ClaimLogIter>, StoreError>;

    /// Records a successful claim. Failures here must never unwind a claim
    /// that has already sent funds; see `Faucet::claim`. Takes a
    /// cancellation token for the same reason as [`Bank`]'s methods, though
    /// a claim already committed by `send` is logged regardless of whether
    /// the request was cancelled in the meantime.
    async fn log_claim(
        &self,
        t: DateTime<Utc>,
        client: Ipv6Addr,
        recipient: &str,
        amount: f64,
        tx: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;
}

/// Sends notifications about important events. Methods are called once,
/// synchronously, when a tracked condition transitions from false to true;
/// implementations that need to perform I/O should dispatch it themselves
/// (e.g. by spawning a task) rather than blocking the caller.
pub trait Alerter: Send + Sync {
    /// The bank's balance has dropped to or below the configured floor.
    fn balance_alert(&self, balance: f64);

    /// The rolling giveaway total has exceeded the configured rate limit.
    fn rate_alert(&self, amount: f64, period: chrono::Duration);
}

/// Everything that can go wrong servicing a claim request.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid recipient address")]
    InvalidRecipient,
    #[error("invalid or missing token")]
    InvalidToken,
    #[error("this client must wait until {0}")]
    MustWait(DateTime<Utc>),
    #[error("service paused")]
    Paused,
    #[error("no funds in the bank")]
    NoFunds,
    #[error("failed to send coins: {0}")]
    Send(#[source] BoxError),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(#[source] BoxError),
    #[error(transparent)]
    InvalidClientAddress(#[from] InvalidClientAddress),
    /// The request's cancellation token fired before `send` committed the
    /// claim. Any rate-limit reservation taken for this attempt has already
    /// been released.
    #[error("claim cancelled")]
    Cancelled,
}
