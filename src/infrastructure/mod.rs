//! Adapters implementing the domain ports.
//!
//! In-memory repositories back the tests and the default CLI run; RocksDB
//! persistence is available behind the `storage-rocksdb` feature. The rail
//! adapter and the sandbox providers stand in for the external services.

pub mod in_memory;
pub mod rail;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sandbox;
