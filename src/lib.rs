//! Hospital Stock Ledger
//!
//! Per-lot, per-warehouse quantity records for hospital supplies, mutated only
//! through `increment`, `decrement` and `transfer` under row locks.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod models;
pub mod repositories;
pub mod services;

pub use errors::ServiceError;
pub use models::{PrincipalStock, PrincipalStockKey, QuantityRecord, StockKey, WarehouseType};
pub use repositories::{InMemoryQuantityStore, QuantityStore, SeaOrmQuantityStore, StockTransaction};
pub use services::{DecrementStock, IncrementStock, StockService, TransferOutcome, TransferStock};
