//! Claim policy engine for a cryptocurrency testnet faucet.
//!
//! This crate is free of I/O: it decides whether a claim is allowed and
//! computes the amount to send, but leaves talking to a wallet, a database
//! or an alerting channel to the collaborator traits in [`interfaces`].
//! [`faucetd`](../faucetd/index.html) wires concrete implementations of
//! those traits to this crate's [`faucet::Faucet`] orchestrator.

pub mod alert;
pub mod base58;
pub mod clientaddr;
pub mod clock;
pub mod faucet;
pub mod interfaces;
pub mod rcdb;
pub mod token;

pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use faucet::{Faucet, FaucetConfig, RateLimitConfig};
pub use interfaces::{
    Alerter, Bank, BankError, ClaimError, ClaimLogIter, ClaimLogRecord, FaucetDb, StoreError,
    VecClaimLogIter,
};
