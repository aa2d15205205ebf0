//! Application layer orchestrating the domain against the ports.
//!
//! `LimitGate` decides whether an amount may move, `ConversionSaga` moves it
//! across the rail and the brokerage, and `WebhookProcessor` feeds vendor
//! notifications back into the saga. Every outbound call goes through the
//! `RetryExecutor`.

pub mod limits;
pub mod retry;
pub mod saga;
pub mod webhook;
