use chrono::{Duration, NaiveTime, Utc};
use metrics::{counter, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, JoinType, Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    RelationTrait, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::{
    db,
    entities::{
        location::{self, Entity as LocationEntity},
        product::{self, Entity as ProductEntity},
        product_batch::{self, Entity as ProductBatchEntity},
        production_order::{self, Entity as ProductionOrderEntity, ProductionOrderStatus},
        recipe::Entity as RecipeEntity,
        stock_balance::{self, Entity as StockBalanceEntity},
        stock_movement::MovementKind,
    },
    errors::{ServiceError, Shortfall},
    events::{Event, EventSender},
    services::{
        recipes::{self, MaterialRequirement},
        stock_ledger::{self, NewMovement},
    },
};

/// Executes production orders: `DRAFT → CONSUMED`, consuming raw materials
/// through the stock ledger and emitting one finished-goods batch.
#[derive(Clone)]
pub struct ProductionService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl ProductionService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        product_id: i64,
        recipe_id: i64,
        warehouse_id: i64,
        batch_multiplier: Decimal,
        note: Option<String>,
        created_by: Option<String>,
    ) -> Result<production_order::Model, ServiceError> {
        if batch_multiplier <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "batch multiplier must be positive, got {}",
                batch_multiplier
            )));
        }

        let db = &*self.db;

        let recipe = RecipeEntity::find_by_id(recipe_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("recipe {} not found", recipe_id)))?;
        if recipe.product_id != product_id {
            return Err(ServiceError::ValidationError(format!(
                "recipe {} does not belong to product {}",
                recipe_id, product_id
            )));
        }

        let created = production_order::ActiveModel {
            product_id: Set(product_id),
            recipe_id: Set(recipe_id),
            warehouse_id: Set(warehouse_id),
            batch_multiplier: Set(batch_multiplier),
            status: Set(ProductionOrderStatus::Draft.as_ref().to_string()),
            scheduled_for: Set(Utc::now()),
            note: Set(note),
            created_by: Set(created_by),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!("failed to create production order: {}", e);
            ServiceError::db_error(e)
        })?;

        counter!("production.orders.created", 1);
        info!(order_id = created.id, product_id, "production order created");
        Ok(created)
    }

    /// Availability pre-check: would the order's warehouse cover the expanded
    /// recipe today? Reads current balances; performs no mutation.
    #[instrument(skip(self))]
    pub async fn validate(&self, order_id: i64) -> Result<(), ServiceError> {
        let db = &*self.db;

        let order = ProductionOrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("production order {} not found", order_id))
            })?;

        let requirements =
            recipes::requirements_in(db, order.recipe_id, order.batch_multiplier).await?;
        check_availability(db, order.warehouse_id, &requirements).await
    }

    /// Runs the order to completion in one transaction:
    ///
    /// 1. validate warehouse-wide availability per expanded recipe line,
    /// 2. consume greedily across the warehouse's locations in name order
    ///    (the same deterministic order validation summed over), each draw a
    ///    ledger movement,
    /// 3. emit the finished batch into the warehouse's first active
    ///    location, with generated code and computed expiry,
    /// 4. mark the order CONSUMED.
    ///
    /// Idempotent: an already-CONSUMED order returns `None` untouched.
    #[instrument(skip(self))]
    pub async fn execute(
        &self,
        order_id: i64,
        actor: Option<String>,
    ) -> Result<Option<product_batch::Model>, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut order_query =
            ProductionOrderEntity::find().filter(production_order::Column::Id.eq(order_id));
        if db::backend_supports_row_locks(txn.get_database_backend()) {
            order_query = order_query.lock_exclusive();
        }
        let order = order_query
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("production order {} not found", order_id))
            })?;

        let status = order.order_status().map_err(|_| {
            ServiceError::InternalError(format!(
                "unknown status '{}' on production order {}",
                order.status, order.id
            ))
        })?;
        if status == ProductionOrderStatus::Consumed {
            info!(order_id, "production order already consumed, skipping");
            return Ok(None);
        }

        if order.batch_multiplier <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "batch multiplier must be positive, got {}",
                order.batch_multiplier
            )));
        }

        let product = ProductEntity::find_by_id(order.product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("product {} not found", order.product_id))
            })?;

        let recipe = RecipeEntity::find_by_id(order.recipe_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("recipe {} not found", order.recipe_id))
            })?;

        // Destination is resolved before consumption so a warehouse with no
        // location fails with nothing consumed.
        let destination = LocationEntity::find()
            .filter(location::Column::WarehouseId.eq(order.warehouse_id))
            .filter(location::Column::Active.eq(true))
            .order_by(location::Column::Name, Order::Asc)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::NoDestinationLocation {
                warehouse_id: order.warehouse_id,
            })?;

        let requirements =
            recipes::requirements_in(&txn, order.recipe_id, order.batch_multiplier).await?;
        check_availability(&txn, order.warehouse_id, &requirements).await?;

        for requirement in &requirements {
            self.consume_requirement(&txn, &order, &product, requirement, actor.as_deref())
                .await?;
        }

        let yield_quantity = recipe.yield_per_batch * order.batch_multiplier;
        let produced_at = order.scheduled_for;
        let expiry_date = (produced_at + Duration::days(i64::from(product.shelf_life_days)))
            .date_naive();
        let code = next_batch_code(&txn, product.id, produced_at).await?;

        let batch = product_batch::ActiveModel {
            product_id: Set(product.id),
            production_order_id: Set(Some(order.id)),
            location_id: Set(destination.id),
            code: Set(code),
            produced_at: Set(produced_at),
            expiry_date: Set(expiry_date),
            initial_quantity: Set(yield_quantity),
            available_quantity: Set(yield_quantity),
            created_by: Set(actor.clone()),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!("failed to create product batch: {}", e);
            ServiceError::db_error(e)
        })?;

        let order_id = order.id;
        let mut active: production_order::ActiveModel = order.into();
        active.status = Set(ProductionOrderStatus::Consumed.as_ref().to_string());
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("production.orders.executed", 1);
        histogram!(
            "production.batches.yield",
            yield_quantity.to_f64().unwrap_or(0.0)
        );

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::ProductionOrderExecuted {
                    order_id,
                    product_id: product.id,
                    batch_id: batch.id,
                    batch_code: batch.code.clone(),
                    quantity: yield_quantity,
                })
                .await;
            sender
                .send_or_log(Event::BatchCreated {
                    batch_id: batch.id,
                    product_id: product.id,
                    location_id: batch.location_id,
                    code: batch.code.clone(),
                    expiry_date: batch.expiry_date,
                    initial_quantity: batch.initial_quantity,
                })
                .await;
        }

        info!(
            order_id,
            batch_id = batch.id,
            code = %batch.code,
            quantity = %yield_quantity,
            "production order executed"
        );

        Ok(Some(batch))
    }

    /// Draws one expanded requirement from the warehouse's locations in name
    /// order, one CONSUMPTION movement per draw. A residual after every
    /// stocked location is drained means a concurrent writer beat us between
    /// validation and here; the error rolls the whole order back.
    async fn consume_requirement<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &production_order::Model,
        product: &product::Model,
        requirement: &MaterialRequirement,
        actor: Option<&str>,
    ) -> Result<(), ServiceError> {
        let mut pending = requirement.required;

        let mut balances_query = StockBalanceEntity::find()
            .filter(stock_balance::Column::MaterialId.eq(requirement.material_id))
            .filter(stock_balance::Column::Quantity.gt(Decimal::ZERO))
            .join(JoinType::InnerJoin, stock_balance::Relation::Location.def())
            .filter(location::Column::WarehouseId.eq(order.warehouse_id))
            .order_by(location::Column::Name, Order::Asc);
        if db::backend_supports_row_locks(conn.get_database_backend()) {
            balances_query = balances_query.lock_exclusive();
        }
        let balances = balances_query
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        for balance in balances {
            if pending <= Decimal::ZERO {
                break;
            }
            let take = pending.min(balance.quantity);
            if take > Decimal::ZERO {
                stock_ledger::apply_new_movement(
                    conn,
                    &NewMovement {
                        material_id: requirement.material_id,
                        location_id: balance.location_id,
                        kind: MovementKind::Consumption,
                        quantity: take,
                        occurred_at: None,
                        note: Some(format!("production order #{} {}", order.id, product.name)),
                        recorded_by: actor.map(str::to_string),
                    },
                )
                .await?;
                pending -= take;
            }
        }

        if pending > Decimal::ZERO {
            warn!(
                order_id = order.id,
                material = %requirement.material_name,
                remaining = %pending,
                "allocation fell short after validation"
            );
            return Err(ServiceError::ConsistencyError(format!(
                "allocation of {} fell short by {} for production order {}",
                requirement.material_name, pending, order.id
            )));
        }

        Ok(())
    }
}

/// Sums each requirement over the warehouse's locations and reports every
/// shortfall at once.
async fn check_availability<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: i64,
    requirements: &[MaterialRequirement],
) -> Result<(), ServiceError> {
    let mut shortfalls = Vec::new();

    for requirement in requirements {
        let available =
            stock_ledger::warehouse_balance_in(conn, warehouse_id, requirement.material_id).await?;
        if available < requirement.required {
            shortfalls.push(Shortfall {
                item: requirement.material_name.clone(),
                required: requirement.required,
                available,
            });
        }
    }

    if shortfalls.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::InsufficientStock(shortfalls))
    }
}

/// `{product_id}-{YYYYMMDD}-{seq:03}` where the sequence counts batches of
/// the product on the production date. Runs inside the execute transaction;
/// the unique index on `code` backstops concurrent executions.
async fn next_batch_code<C: ConnectionTrait>(
    conn: &C,
    product_id: i64,
    produced_at: chrono::DateTime<Utc>,
) -> Result<String, ServiceError> {
    let day = produced_at.date_naive();
    let day_start = day.and_time(NaiveTime::MIN).and_utc();
    let day_end = day_start + Duration::days(1);

    let prior = ProductBatchEntity::find()
        .filter(product_batch::Column::ProductId.eq(product_id))
        .filter(product_batch::Column::ProducedAt.gte(day_start))
        .filter(product_batch::Column::ProducedAt.lt(day_end))
        .count(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(format!(
        "{}-{}-{:03}",
        product_id,
        day.format("%Y%m%d"),
        prior + 1
    ))
}
