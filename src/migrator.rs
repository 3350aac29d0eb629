use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240501_000001_create_tenancy_tables::Migration),
            Box::new(m20240501_000002_create_stock_tables::Migration),
            Box::new(m20240501_000003_create_product_tables::Migration),
            Box::new(m20240501_000004_create_production_tables::Migration),
            Box::new(m20240501_000005_create_sales_tables::Migration),
        ]
    }
}

// Migration implementations

mod m20240501_000001_create_tenancy_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240501_000001_create_tenancy_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Tenants::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Tenants::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Tenants::Name).string().not_null())
                        .col(ColumnDef::new(Tenants::Plan).string().not_null())
                        .col(
                            ColumnDef::new(Tenants::SubscriptionStatus)
                                .string()
                                .not_null()
                                .default("trialing"),
                        )
                        .col(
                            ColumnDef::new(Tenants::OnboardingComplete)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Tenants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(UnitsOfMeasure::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(UnitsOfMeasure::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(UnitsOfMeasure::Name)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Warehouses::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Warehouses::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Warehouses::TenantId).big_integer().not_null())
                        .col(ColumnDef::new(Warehouses::Name).string().not_null())
                        .col(ColumnDef::new(Warehouses::Address).string().null())
                        .col(
                            ColumnDef::new(Warehouses::IsPrimary)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Warehouses::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Warehouses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_warehouses_tenant_name")
                        .table(Warehouses::Table)
                        .col(Warehouses::TenantId)
                        .col(Warehouses::Name)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Locations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Locations::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(Locations::WarehouseId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Locations::Name).string().not_null())
                        .col(
                            ColumnDef::new(Locations::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Locations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_locations_warehouse_name")
                        .table(Locations::Table)
                        .col(Locations::WarehouseId)
                        .col(Locations::Name)
                        .unique()
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Locations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Warehouses::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(UnitsOfMeasure::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Tenants::Table).to_owned())
                .await?;
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    enum Tenants {
        Table,
        Id,
        Name,
        Plan,
        SubscriptionStatus,
        OnboardingComplete,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum UnitsOfMeasure {
        Table,
        Id,
        Name,
    }

    #[derive(DeriveIden)]
    pub(super) enum Warehouses {
        Table,
        Id,
        TenantId,
        Name,
        Address,
        IsPrimary,
        Active,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Locations {
        Table,
        Id,
        WarehouseId,
        Name,
        Active,
        CreatedAt,
    }
}

mod m20240501_000002_create_stock_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240501_000002_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Materials::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Materials::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Materials::TenantId).big_integer().not_null())
                        .col(ColumnDef::new(Materials::Name).string().not_null())
                        .col(ColumnDef::new(Materials::UnitId).big_integer().not_null())
                        .col(
                            ColumnDef::new(Materials::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Materials::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_materials_tenant_name")
                        .table(Materials::Table)
                        .col(Materials::TenantId)
                        .col(Materials::Name)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(StockBalances::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockBalances::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(StockBalances::LocationId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockBalances::MaterialId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockBalances::Quantity)
                                .decimal_len(12, 3)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBalances::ReorderMinimum)
                                .decimal_len(12, 3)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StockBalances::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // The per-key serialization point: one row per (location, material).
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_stock_balances_location_material")
                        .table(StockBalances::Table)
                        .col(StockBalances::LocationId)
                        .col(StockBalances::MaterialId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::MaterialId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::LocationId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::Kind).string().not_null())
                        .col(
                            ColumnDef::new(StockMovements::Quantity)
                                .decimal_len(12, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::OccurredAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::Note).string().null())
                        .col(ColumnDef::new(StockMovements::RecordedBy).string().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_material_occurred_at")
                        .table(StockMovements::Table)
                        .col(StockMovements::MaterialId)
                        .col(StockMovements::OccurredAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_location")
                        .table(StockMovements::Table)
                        .col(StockMovements::LocationId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(StockBalances::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Materials::Table).to_owned())
                .await?;
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    enum Materials {
        Table,
        Id,
        TenantId,
        Name,
        UnitId,
        Active,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum StockBalances {
        Table,
        Id,
        LocationId,
        MaterialId,
        Quantity,
        ReorderMinimum,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum StockMovements {
        Table,
        Id,
        MaterialId,
        LocationId,
        Kind,
        Quantity,
        OccurredAt,
        Note,
        RecordedBy,
    }
}

mod m20240501_000003_create_product_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240501_000003_create_product_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Products::TenantId).big_integer().not_null())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::UnitId).big_integer().not_null())
                        .col(
                            ColumnDef::new(Products::ShelfLifeDays)
                                .integer()
                                .not_null()
                                .default(3),
                        )
                        .col(
                            ColumnDef::new(Products::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_products_tenant_name")
                        .table(Products::Table)
                        .col(Products::TenantId)
                        .col(Products::Name)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Recipes::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Recipes::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Recipes::ProductId).big_integer().not_null())
                        .col(ColumnDef::new(Recipes::Name).string().not_null())
                        .col(
                            ColumnDef::new(Recipes::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Recipes::YieldPerBatch)
                                .decimal_len(12, 3)
                                .not_null()
                                .default(1),
                        )
                        .col(ColumnDef::new(Recipes::Description).string().null())
                        .col(
                            ColumnDef::new(Recipes::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Recipes::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_recipes_product_name_version")
                        .table(Recipes::Table)
                        .col(Recipes::ProductId)
                        .col(Recipes::Name)
                        .col(Recipes::Version)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(RecipeLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(RecipeLines::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(RecipeLines::RecipeId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RecipeLines::MaterialId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RecipeLines::Quantity)
                                .decimal_len(12, 3)
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_recipe_lines_recipe_material")
                        .table(RecipeLines::Table)
                        .col(RecipeLines::RecipeId)
                        .col(RecipeLines::MaterialId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(RecipeLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Recipes::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await?;
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        TenantId,
        Name,
        UnitId,
        ShelfLifeDays,
        Active,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Recipes {
        Table,
        Id,
        ProductId,
        Name,
        Version,
        YieldPerBatch,
        Description,
        Active,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum RecipeLines {
        Table,
        Id,
        RecipeId,
        MaterialId,
        Quantity,
    }
}

mod m20240501_000004_create_production_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240501_000004_create_production_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProductionOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductionOrders::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(ProductionOrders::ProductId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductionOrders::RecipeId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductionOrders::WarehouseId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductionOrders::BatchMultiplier)
                                .decimal_len(12, 3)
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(ProductionOrders::Status)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductionOrders::ScheduledFor)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductionOrders::Note).string().null())
                        .col(ColumnDef::new(ProductionOrders::CreatedBy).string().null())
                        .col(
                            ColumnDef::new(ProductionOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_production_orders_warehouse_status")
                        .table(ProductionOrders::Table)
                        .col(ProductionOrders::WarehouseId)
                        .col(ProductionOrders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductBatches::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductBatches::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(ProductBatches::ProductId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductBatches::ProductionOrderId)
                                .big_integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ProductBatches::LocationId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductBatches::Code).string().not_null())
                        .col(
                            ColumnDef::new(ProductBatches::ProducedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductBatches::ExpiryDate)
                                .date()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductBatches::InitialQuantity)
                                .decimal_len(12, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductBatches::AvailableQuantity)
                                .decimal_len(12, 3)
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductBatches::CreatedBy).string().null())
                        .col(
                            ColumnDef::new(ProductBatches::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Backstops the per-day sequence in the generated code against
            // concurrent executions.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uidx_product_batches_code")
                        .table(ProductBatches::Table)
                        .col(ProductBatches::Code)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_product_batches_product_expiry")
                        .table(ProductBatches::Table)
                        .col(ProductBatches::ProductId)
                        .col(ProductBatches::ExpiryDate)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductBatches::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProductionOrders::Table).to_owned())
                .await?;
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    enum ProductionOrders {
        Table,
        Id,
        ProductId,
        RecipeId,
        WarehouseId,
        BatchMultiplier,
        Status,
        ScheduledFor,
        Note,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ProductBatches {
        Table,
        Id,
        ProductId,
        ProductionOrderId,
        LocationId,
        Code,
        ProducedAt,
        ExpiryDate,
        InitialQuantity,
        AvailableQuantity,
        CreatedBy,
        CreatedAt,
    }
}

mod m20240501_000005_create_sales_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240501_000005_create_sales_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SalesOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesOrders::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::TenantId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::WarehouseId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrders::Status).string().not_null())
                        .col(
                            ColumnDef::new(SalesOrders::PlacedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrders::Note).string().null())
                        .col(ColumnDef::new(SalesOrders::CreatedBy).string().null())
                        .col(
                            ColumnDef::new(SalesOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SalesOrderLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesOrderLines::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::SalesOrderId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::ProductId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderLines::Quantity)
                                .decimal_len(12, 3)
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_order_lines_order")
                        .table(SalesOrderLines::Table)
                        .col(SalesOrderLines::SalesOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SalesConsumptions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesConsumptions::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(SalesConsumptions::SalesOrderId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesConsumptions::SalesOrderLineId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesConsumptions::ProductBatchId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesConsumptions::Quantity)
                                .decimal_len(12, 3)
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesConsumptions::CreatedBy).string().null())
                        .col(
                            ColumnDef::new(SalesConsumptions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_consumptions_order")
                        .table(SalesConsumptions::Table)
                        .col(SalesConsumptions::SalesOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_consumptions_batch")
                        .table(SalesConsumptions::Table)
                        .col(SalesConsumptions::ProductBatchId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SalesConsumptions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SalesOrderLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SalesOrders::Table).to_owned())
                .await?;
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    enum SalesOrders {
        Table,
        Id,
        TenantId,
        WarehouseId,
        Status,
        PlacedAt,
        Note,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum SalesOrderLines {
        Table,
        Id,
        SalesOrderId,
        ProductId,
        Quantity,
    }

    #[derive(DeriveIden)]
    enum SalesConsumptions {
        Table,
        Id,
        SalesOrderId,
        SalesOrderLineId,
        ProductBatchId,
        Quantity,
        CreatedBy,
        CreatedAt,
    }
}
