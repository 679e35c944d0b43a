//! Tally - points ledger and reward redemption engine.
//!
//! Customers earn points from payment events reported by a point-of-sale
//! provider and spend them on rewards through a token/PIN redemption flow
//! verified in person at the merchant terminal. Correctness holds under
//! concurrent access and at-least-once event delivery: the ledger is
//! append-only with idempotent writes, redemption transitions are
//! check-and-set, and webhook processing absorbs redelivery at every dedup
//! point.

pub mod config;
pub mod domain;
pub mod interfaces;
pub mod ledger;
pub mod points;
pub mod redemption;
pub mod storage;
pub mod sweeper;
pub mod utils;
pub mod webhook;
