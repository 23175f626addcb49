// Stock ledger
pub mod stock;

pub use stock::{DecrementStock, IncrementStock, StockService, TransferOutcome, TransferStock};
