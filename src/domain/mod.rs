//! Domain types and the ports the application layer depends on.
//!
//! Nothing in here performs I/O; repositories and external providers are
//! reached only through the traits in [`ports`].

pub mod account;
pub mod conversion;
pub mod deposit;
pub mod limits;
pub mod money;
pub mod ports;
