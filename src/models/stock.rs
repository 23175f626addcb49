use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{EnumIter, EnumString};

use crate::errors::ServiceError;

/// Kind of storage location a lot can be held in.
///
/// The canonical tag is what gets persisted. The legacy `almacen*` codes used
/// by older hospital records are accepted on input and map to the same variant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum WarehouseType {
    #[serde(rename = "central", alias = "almacenCent")]
    #[strum(serialize = "central", serialize = "almacenCent")]
    Central,
    #[serde(rename = "principal", alias = "almacenPrin")]
    #[strum(serialize = "principal", serialize = "almacenPrin")]
    Principal,
    #[serde(rename = "pharmacy", alias = "almacenFarm")]
    #[strum(serialize = "pharmacy", serialize = "almacenFarm")]
    Pharmacy,
    #[serde(rename = "parallel", alias = "almacenPar")]
    #[strum(serialize = "parallel", serialize = "almacenPar")]
    Parallel,
    #[serde(rename = "support_services", alias = "almacenServApoyo")]
    #[strum(serialize = "support_services", serialize = "almacenServApoyo")]
    SupportServices,
    #[serde(
        rename = "care_services",
        alias = "almacenServAtenciones",
        alias = "almacenServAtencion"
    )]
    #[strum(
        serialize = "care_services",
        serialize = "almacenServAtenciones",
        serialize = "almacenServAtencion"
    )]
    CareServices,
    #[serde(rename = "auxiliary", alias = "almacenAus")]
    #[strum(serialize = "auxiliary", serialize = "almacenAus")]
    Auxiliary,
    #[serde(rename = "emergency")]
    #[strum(serialize = "emergency")]
    Emergency,
    #[serde(rename = "consultation")]
    #[strum(serialize = "consultation")]
    Consultation,
}

impl WarehouseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarehouseType::Central => "central",
            WarehouseType::Principal => "principal",
            WarehouseType::Pharmacy => "pharmacy",
            WarehouseType::Parallel => "parallel",
            WarehouseType::SupportServices => "support_services",
            WarehouseType::CareServices => "care_services",
            WarehouseType::Auxiliary => "auxiliary",
            WarehouseType::Emergency => "emergency",
            WarehouseType::Consultation => "consultation",
        }
    }

    /// Parses a canonical tag or legacy code, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        WarehouseType::from_str(value.trim()).map_err(|_| {
            ServiceError::ValidationError(format!("unknown warehouse type '{}'", value))
        })
    }
}

impl fmt::Display for WarehouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a quantity record.
///
/// The derived ordering (lot, then warehouse type, then warehouse id) is the
/// canonical lock order for operations touching more than one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub lot_id: i64,
    pub warehouse_type: WarehouseType,
    pub warehouse_id: i64,
}

impl StockKey {
    pub fn new(lot_id: i64, warehouse_type: WarehouseType, warehouse_id: i64) -> Self {
        Self {
            lot_id,
            warehouse_type,
            warehouse_id,
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lot {} at {}#{}",
            self.lot_id, self.warehouse_type, self.warehouse_id
        )
    }
}

/// Units of one lot held at one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityRecord {
    pub id: i64,
    pub lot_id: i64,
    pub warehouse_type: WarehouseType,
    pub warehouse_id: i64,
    pub hospital_id: i64,
    pub site_id: Option<i64>,
    pub quantity: i64,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl QuantityRecord {
    /// A fresh, empty record for `key`.
    pub fn empty(id: i64, key: &StockKey, hospital_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            lot_id: key.lot_id,
            warehouse_type: key.warehouse_type,
            warehouse_id: key.warehouse_id,
            hospital_id,
            site_id: None,
            quantity: 0,
            last_updated: now,
            created_at: now,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.lot_id, self.warehouse_type, self.warehouse_id)
    }

    /// Adds `amount`, flooring the result at zero.
    pub(crate) fn apply_increment(&mut self, amount: i64, now: DateTime<Utc>) {
        self.quantity = clamped_add(self.quantity, amount);
        self.last_updated = now;
    }

    /// Removes `amount`, refusing to go below zero.
    pub(crate) fn apply_decrement(
        &mut self,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if self.quantity < amount {
            return Err(ServiceError::InsufficientStock {
                key: self.key(),
                available: self.quantity,
            });
        }
        self.quantity -= amount;
        self.last_updated = now;
        Ok(())
    }
}

/// Identity of a principal-warehouse aggregate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrincipalStockKey {
    pub site_id: i64,
    pub lot_id: i64,
    pub hospital_id: i64,
}

impl fmt::Display for PrincipalStockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "principal stock of lot {} at site {} (hospital {})",
            self.lot_id, self.site_id, self.hospital_id
        )
    }
}

/// Per-site total held in the principal warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalStock {
    pub id: i64,
    pub site_id: i64,
    pub lot_id: i64,
    pub hospital_id: i64,
    pub quantity: i64,
    pub status: bool,
    pub updated_at: DateTime<Utc>,
}

impl PrincipalStock {
    pub fn empty(id: i64, key: &PrincipalStockKey, now: DateTime<Utc>) -> Self {
        Self {
            id,
            site_id: key.site_id,
            lot_id: key.lot_id,
            hospital_id: key.hospital_id,
            quantity: 0,
            status: true,
            updated_at: now,
        }
    }

    pub fn key(&self) -> PrincipalStockKey {
        PrincipalStockKey {
            site_id: self.site_id,
            lot_id: self.lot_id,
            hospital_id: self.hospital_id,
        }
    }

    pub(crate) fn apply_increment(&mut self, amount: i64, now: DateTime<Utc>) {
        self.quantity = clamped_add(self.quantity, amount);
        self.updated_at = now;
    }
}

/// `max(0, quantity + amount)` without overflowing.
pub fn clamped_add(quantity: i64, amount: i64) -> i64 {
    quantity.saturating_add(amount).max(0)
}
