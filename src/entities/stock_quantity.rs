use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::models::{QuantityRecord, WarehouseType};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_quantities")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub lot_id: i64,
    pub warehouse_type: String,
    pub warehouse_id: i64,
    pub hospital_id: i64,
    pub site_id: Option<i64>,
    pub quantity: i64,
    pub last_updated: DateTimeUtc,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for QuantityRecord {
    type Error = ServiceError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let warehouse_type = WarehouseType::parse(&model.warehouse_type).map_err(|_| {
            ServiceError::InternalError(format!(
                "stock row {} has unknown warehouse type '{}'",
                model.id, model.warehouse_type
            ))
        })?;
        Ok(QuantityRecord {
            id: i64::from(model.id),
            lot_id: model.lot_id,
            warehouse_type,
            warehouse_id: model.warehouse_id,
            hospital_id: model.hospital_id,
            site_id: model.site_id,
            quantity: model.quantity,
            last_updated: model.last_updated,
            created_at: model.created_at,
        })
    }
}
