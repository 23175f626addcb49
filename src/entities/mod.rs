pub mod principal_stock;
pub mod stock_quantity;
