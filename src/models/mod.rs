pub mod stock;

pub use stock::{
    clamped_add, PrincipalStock, PrincipalStockKey, QuantityRecord, StockKey, WarehouseType,
};
