use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::PrincipalStock;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "principal_stock")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub site_id: i64,
    pub lot_id: i64,
    pub hospital_id: i64,
    pub quantity: i64,
    pub status: bool,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for PrincipalStock {
    fn from(model: Model) -> Self {
        PrincipalStock {
            id: i64::from(model.id),
            site_id: model.site_id,
            lot_id: model.lot_id,
            hospital_id: model.hospital_id,
            quantity: model.quantity,
            status: model.status,
            updated_at: model.updated_at,
        }
    }
}
