use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250919_000001_create_stock_quantities_table::Migration),
            Box::new(m20250924_000002_create_principal_stock_table::Migration),
        ]
    }
}

mod m20250919_000001_create_stock_quantities_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250919_000001_create_stock_quantities_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockQuantities::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockQuantities::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(StockQuantities::LotId).big_integer().not_null())
                        .col(
                            ColumnDef::new(StockQuantities::WarehouseType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockQuantities::WarehouseId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockQuantities::HospitalId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockQuantities::SiteId).big_integer())
                        .col(
                            ColumnDef::new(StockQuantities::Quantity)
                                .big_integer()
                                .not_null()
                                .default(0)
                                .check(Expr::col(StockQuantities::Quantity).gte(0)),
                        )
                        .col(
                            ColumnDef::new(StockQuantities::LastUpdated)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockQuantities::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // one row per (lot, warehouse type, warehouse)
            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_quantities_key")
                        .table(StockQuantities::Table)
                        .col(StockQuantities::LotId)
                        .col(StockQuantities::WarehouseType)
                        .col(StockQuantities::WarehouseId)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_quantities_hospital")
                        .table(StockQuantities::Table)
                        .col(StockQuantities::HospitalId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockQuantities::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum StockQuantities {
        Table,
        Id,
        LotId,
        WarehouseType,
        WarehouseId,
        HospitalId,
        SiteId,
        Quantity,
        LastUpdated,
        CreatedAt,
    }
}

mod m20250924_000002_create_principal_stock_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250924_000002_create_principal_stock_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PrincipalStock::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PrincipalStock::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(PrincipalStock::SiteId).big_integer().not_null())
                        .col(ColumnDef::new(PrincipalStock::LotId).big_integer().not_null())
                        .col(
                            ColumnDef::new(PrincipalStock::HospitalId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PrincipalStock::Quantity)
                                .big_integer()
                                .not_null()
                                .default(0)
                                .check(Expr::col(PrincipalStock::Quantity).gte(0)),
                        )
                        .col(
                            ColumnDef::new(PrincipalStock::Status)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(PrincipalStock::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_principal_stock_key")
                        .table(PrincipalStock::Table)
                        .col(PrincipalStock::SiteId)
                        .col(PrincipalStock::LotId)
                        .col(PrincipalStock::HospitalId)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PrincipalStock::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum PrincipalStock {
        Table,
        Id,
        SiteId,
        LotId,
        HospitalId,
        Quantity,
        Status,
        UpdatedAt,
    }
}
