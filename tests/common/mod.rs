#![allow(dead_code)]

use std::sync::Arc;

use bakeline_core::{
    config::AppConfig,
    db,
    entities::{
        location, material, product, product_batch, recipe, tenant, tenant::PlanTier,
        unit_of_measure, warehouse,
    },
    events::{process_events, EventSender},
    services::stock_ledger::NewMovement,
    CoreServices,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection};
use tokio::sync::mpsc;

/// Test harness: core services over an in-memory SQLite database.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub core: CoreServices,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::for_database("sqlite::memory:");
        // In-memory SQLite exists per connection; a second pooled connection
        // would see an empty database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.auto_migrate = true;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        let db = Arc::new(pool);

        let (tx, rx) = mpsc::channel(256);
        let event_task = tokio::spawn(process_events(rx, Vec::new()));
        let core = CoreServices::new(db.clone(), Some(EventSender::new(tx)));

        Self {
            db,
            core,
            _event_task: event_task,
        }
    }
}

/// A seeded single-warehouse bakery: two locations, two raw materials, one
/// product with a two-line recipe (0.5 flour + 0.1 yeast per batch, yielding
/// 10 bread).
pub struct Bakery {
    pub tenant: tenant::Model,
    pub warehouse: warehouse::Model,
    pub loc_a: location::Model,
    pub loc_b: location::Model,
    pub kg: unit_of_measure::Model,
    pub flour: material::Model,
    pub yeast: material::Model,
    pub bread: product::Model,
    pub recipe: recipe::Model,
}

pub async fn seed_bakery(app: &TestApp) -> Bakery {
    let tenant = app
        .core
        .tenancy
        .create_tenant("Big Momma Bakery".into(), PlanTier::MultiSite)
        .await
        .expect("seed tenant");
    let warehouse = app
        .core
        .tenancy
        .create_warehouse(tenant.id, "Central".into(), None, true)
        .await
        .expect("seed warehouse");
    let loc_a = app
        .core
        .tenancy
        .create_location(warehouse.id, "Aisle 1".into())
        .await
        .expect("seed location a");
    let loc_b = app
        .core
        .tenancy
        .create_location(warehouse.id, "Aisle 2".into())
        .await
        .expect("seed location b");

    let kg = seed_unit(&app.db, "kg").await;
    let flour = seed_material(&app.db, tenant.id, "flour", kg.id).await;
    let yeast = seed_material(&app.db, tenant.id, "yeast", kg.id).await;
    let bread = seed_product(&app.db, tenant.id, "sourdough", kg.id, 3).await;

    let recipe = app
        .core
        .recipes
        .create_recipe(bread.id, "Traditional".into(), 1, dec("10"), None)
        .await
        .expect("seed recipe");
    app.core
        .recipes
        .add_line(recipe.id, flour.id, dec("0.5"))
        .await
        .expect("seed flour line");
    app.core
        .recipes
        .add_line(recipe.id, yeast.id, dec("0.1"))
        .await
        .expect("seed yeast line");

    Bakery {
        tenant,
        warehouse,
        loc_a,
        loc_b,
        kg,
        flour,
        yeast,
        bread,
        recipe,
    }
}

pub async fn seed_unit(db: &DatabaseConnection, name: &str) -> unit_of_measure::Model {
    unit_of_measure::ActiveModel {
        name: Set(name.to_string()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed unit")
}

pub async fn seed_material(
    db: &DatabaseConnection,
    tenant_id: i64,
    name: &str,
    unit_id: i64,
) -> material::Model {
    material::ActiveModel {
        tenant_id: Set(tenant_id),
        name: Set(name.to_string()),
        unit_id: Set(unit_id),
        active: Set(true),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed material")
}

pub async fn seed_product(
    db: &DatabaseConnection,
    tenant_id: i64,
    name: &str,
    unit_id: i64,
    shelf_life_days: i32,
) -> product::Model {
    product::ActiveModel {
        tenant_id: Set(tenant_id),
        name: Set(name.to_string()),
        unit_id: Set(unit_id),
        shelf_life_days: Set(shelf_life_days),
        active: Set(true),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed product")
}

/// Inserts a finished-goods batch directly, bypassing production, for
/// allocation-ordering scenarios that need exact expiry/creation times.
pub async fn seed_batch(
    db: &DatabaseConnection,
    product_id: i64,
    location_id: i64,
    code: &str,
    expiry_date: NaiveDate,
    quantity: Decimal,
    created_at: DateTime<Utc>,
) -> product_batch::Model {
    product_batch::ActiveModel {
        product_id: Set(product_id),
        production_order_id: Set(None),
        location_id: Set(location_id),
        code: Set(code.to_string()),
        produced_at: Set(created_at),
        expiry_date: Set(expiry_date),
        initial_quantity: Set(quantity),
        available_quantity: Set(quantity),
        created_by: Set(None),
        created_at: Set(created_at),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed batch")
}

/// Posts a receipt through the ledger.
pub async fn receipt(app: &TestApp, material_id: i64, location_id: i64, quantity: Decimal) {
    app.core
        .stock_ledger
        .record(NewMovement {
            material_id,
            location_id,
            kind: bakeline_core::entities::stock_movement::MovementKind::Receipt,
            quantity,
            occurred_at: None,
            note: None,
            recorded_by: Some("test".into()),
        })
        .await
        .expect("seed receipt");
}

pub fn dec(s: &str) -> Decimal {
    s.parse().expect("decimal literal")
}

pub fn days_from_today(days: i64) -> NaiveDate {
    Utc::now().date_naive() + Duration::days(days)
}
