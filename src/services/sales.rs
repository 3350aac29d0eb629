use chrono::{Duration, NaiveDate, Utc};
use metrics::{counter, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, JoinType, Order, QueryFilter, QueryOrder, QuerySelect, RelationTrait,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::{
    db,
    entities::{
        location,
        product::{self, Entity as ProductEntity},
        product_batch::{self, Entity as ProductBatchEntity},
        sales_consumption::{self, Entity as SalesConsumptionEntity},
        sales_order::{self, Entity as SalesOrderEntity, SalesOrderStatus},
        sales_order_line::{self, Entity as SalesOrderLineEntity},
    },
    errors::{ServiceError, Shortfall},
    events::{Event, EventSender},
};

/// Confirms sales orders by consuming finished-goods batches expiry-first,
/// and answers the batch-expiry reporting queries.
#[derive(Clone)]
pub struct SalesService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl SalesService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        tenant_id: i64,
        warehouse_id: i64,
        note: Option<String>,
        created_by: Option<String>,
    ) -> Result<sales_order::Model, ServiceError> {
        let created = sales_order::ActiveModel {
            tenant_id: Set(tenant_id),
            warehouse_id: Set(warehouse_id),
            status: Set(SalesOrderStatus::Draft.as_ref().to_string()),
            placed_at: Set(Utc::now()),
            note: Set(note),
            created_by: Set(created_by),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(|e| {
            error!("failed to create sales order: {}", e);
            ServiceError::db_error(e)
        })?;

        info!(order_id = created.id, warehouse_id, "sales order created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn add_line(
        &self,
        sales_order_id: i64,
        product_id: i64,
        quantity: Decimal,
    ) -> Result<sales_order_line::Model, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "line quantity must be positive, got {}",
                quantity
            )));
        }

        let db = &*self.db;

        let order = SalesOrderEntity::find_by_id(sales_order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("sales order {} not found", sales_order_id))
            })?;
        if order.order_status().ok() == Some(SalesOrderStatus::Confirmed) {
            return Err(ServiceError::InvalidOperation(format!(
                "sales order {} is already confirmed",
                sales_order_id
            )));
        }

        let created = sales_order_line::ActiveModel {
            sales_order_id: Set(sales_order_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        Ok(created)
    }

    /// Could every line of the order be fulfilled from today's sellable
    /// batches? Reads current availability; performs no mutation.
    #[instrument(skip(self))]
    pub async fn validate(&self, order_id: i64) -> Result<(), ServiceError> {
        let db = &*self.db;

        let order = SalesOrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("sales order {} not found", order_id)))?;

        let lines = order_lines(db, order.id).await?;
        let today = Utc::now().date_naive();
        check_availability(db, &order, &lines, today).await
    }

    /// Confirms the order in one transaction:
    ///
    /// 1. validate every line against the sum of sellable batches (expired
    ///    batches are never eligible),
    /// 2. allocate each line greedily over eligible batches ordered by
    ///    `(expiry_date ASC, created_at ASC)` under exclusive locks. This is
    ///    FEFO; the creation-time tie-break makes depletion deterministic,
    /// 3. write one consumption audit row per (batch, line) draw,
    /// 4. mark the order CONFIRMED.
    ///
    /// Idempotent: an already-CONFIRMED order returns an empty vec untouched.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        order_id: i64,
        actor: Option<String>,
    ) -> Result<Vec<sales_consumption::Model>, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut order_query = SalesOrderEntity::find().filter(sales_order::Column::Id.eq(order_id));
        if db::backend_supports_row_locks(txn.get_database_backend()) {
            order_query = order_query.lock_exclusive();
        }
        let order = order_query
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("sales order {} not found", order_id)))?;

        let status = order.order_status().map_err(|_| {
            ServiceError::InternalError(format!(
                "unknown status '{}' on sales order {}",
                order.status, order.id
            ))
        })?;
        if status == SalesOrderStatus::Confirmed {
            info!(order_id, "sales order already confirmed, skipping");
            return Ok(Vec::new());
        }

        let lines = order_lines(&txn, order.id).await?;
        let today = Utc::now().date_naive();
        check_availability(&txn, &order, &lines, today).await?;

        let mut consumptions = Vec::new();
        for line in &lines {
            let drawn = self
                .allocate_line(&txn, &order, line, today, actor.as_deref())
                .await?;
            consumptions.extend(drawn);
        }

        let warehouse_id = order.warehouse_id;
        let mut active: sales_order::ActiveModel = order.into();
        active.status = Set(SalesOrderStatus::Confirmed.as_ref().to_string());
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("sales.orders.confirmed", 1);
        histogram!(
            "sales.allocations.per_order",
            consumptions.len() as f64
        );

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::SalesOrderConfirmed {
                    order_id,
                    warehouse_id,
                    consumption_count: consumptions.len(),
                })
                .await;
        }

        info!(
            order_id,
            consumptions = consumptions.len(),
            "sales order confirmed"
        );

        Ok(consumptions)
    }

    /// FEFO draw for one line. Eligible batches were summed by validation a
    /// moment ago inside this same transaction; a residual here means a
    /// concurrent confirmation raced us, and the whole order rolls back.
    async fn allocate_line<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &sales_order::Model,
        line: &sales_order_line::Model,
        today: NaiveDate,
        actor: Option<&str>,
    ) -> Result<Vec<sales_consumption::Model>, ServiceError> {
        let mut pending = line.quantity;
        let mut drawn = Vec::new();

        let mut batches_query = eligible_batches(order.warehouse_id, line.product_id, today)
            .order_by(product_batch::Column::ExpiryDate, Order::Asc)
            .order_by(product_batch::Column::CreatedAt, Order::Asc);
        if db::backend_supports_row_locks(conn.get_database_backend()) {
            batches_query = batches_query.lock_exclusive();
        }
        let batches = batches_query
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        for batch in batches {
            if pending <= Decimal::ZERO {
                break;
            }
            let take = pending.min(batch.available_quantity);
            if take <= Decimal::ZERO {
                continue;
            }

            let batch_id = batch.id;
            let remaining = batch.available_quantity - take;
            let mut active: product_batch::ActiveModel = batch.into();
            active.available_quantity = Set(remaining);
            active.update(conn).await.map_err(ServiceError::db_error)?;

            let consumption = sales_consumption::ActiveModel {
                sales_order_id: Set(order.id),
                sales_order_line_id: Set(line.id),
                product_batch_id: Set(batch_id),
                quantity: Set(take),
                created_by: Set(actor.map(str::to_string)),
                created_at: Set(Utc::now()),
                ..Default::default()
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;

            histogram!("sales.allocations.quantity", take.to_f64().unwrap_or(0.0));
            drawn.push(consumption);
            pending -= take;
        }

        if pending > Decimal::ZERO {
            warn!(
                order_id = order.id,
                line_id = line.id,
                remaining = %pending,
                "batch allocation fell short after validation"
            );
            return Err(ServiceError::ConsistencyError(format!(
                "allocation for product {} fell short by {} on sales order {}",
                line.product_id, pending, order.id
            )));
        }

        Ok(drawn)
    }

    /// Sellable batches of a tenant expiring within `within_days` days
    /// (today inclusive), soonest first.
    #[instrument(skip(self))]
    pub async fn batches_near_expiry(
        &self,
        tenant_id: i64,
        within_days: i64,
    ) -> Result<Vec<product_batch::Model>, ServiceError> {
        let today = Utc::now().date_naive();
        let horizon = today + Duration::days(within_days);

        ProductBatchEntity::find()
            .join(JoinType::InnerJoin, product_batch::Relation::Product.def())
            .filter(product::Column::TenantId.eq(tenant_id))
            .filter(product_batch::Column::AvailableQuantity.gt(Decimal::ZERO))
            .filter(product_batch::Column::ExpiryDate.gte(today))
            .filter(product_batch::Column::ExpiryDate.lte(horizon))
            .order_by(product_batch::Column::ExpiryDate, Order::Asc)
            .order_by(product_batch::Column::CreatedAt, Order::Asc)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Batches past their expiry date that still hold quantity: the waste
    /// report.
    #[instrument(skip(self))]
    pub async fn expired_batches(
        &self,
        tenant_id: i64,
    ) -> Result<Vec<product_batch::Model>, ServiceError> {
        let today = Utc::now().date_naive();

        ProductBatchEntity::find()
            .join(JoinType::InnerJoin, product_batch::Relation::Product.def())
            .filter(product::Column::TenantId.eq(tenant_id))
            .filter(product_batch::Column::AvailableQuantity.gt(Decimal::ZERO))
            .filter(product_batch::Column::ExpiryDate.lt(today))
            .order_by(product_batch::Column::ExpiryDate, Order::Asc)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Audit trail of a confirmed order, in draw order.
    #[instrument(skip(self))]
    pub async fn consumptions_for(
        &self,
        order_id: i64,
    ) -> Result<Vec<sales_consumption::Model>, ServiceError> {
        SalesConsumptionEntity::find()
            .filter(sales_consumption::Column::SalesOrderId.eq(order_id))
            .order_by(sales_consumption::Column::Id, Order::Asc)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }
}

fn eligible_batches(
    warehouse_id: i64,
    product_id: i64,
    today: NaiveDate,
) -> sea_orm::Select<ProductBatchEntity> {
    // Not expired == status OK or NEAR_EXPIRY; expired batches never sell.
    ProductBatchEntity::find()
        .filter(product_batch::Column::ProductId.eq(product_id))
        .filter(product_batch::Column::AvailableQuantity.gt(Decimal::ZERO))
        .filter(product_batch::Column::ExpiryDate.gte(today))
        .join(JoinType::InnerJoin, product_batch::Relation::Location.def())
        .filter(location::Column::WarehouseId.eq(warehouse_id))
}

async fn order_lines<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
) -> Result<Vec<sales_order_line::Model>, ServiceError> {
    let lines = SalesOrderLineEntity::find()
        .filter(sales_order_line::Column::SalesOrderId.eq(order_id))
        .order_by(sales_order_line::Column::Id, Order::Asc)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if lines.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "sales order {} has no lines",
            order_id
        )));
    }

    Ok(lines)
}

/// Sums sellable availability per line and reports every shortfall at once,
/// named by product.
async fn check_availability<C: ConnectionTrait>(
    conn: &C,
    order: &sales_order::Model,
    lines: &[sales_order_line::Model],
    today: NaiveDate,
) -> Result<(), ServiceError> {
    let mut shortfalls = Vec::new();

    for line in lines {
        let batches = eligible_batches(order.warehouse_id, line.product_id, today)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        let available: Decimal = batches.iter().map(|b| b.available_quantity).sum();

        if available < line.quantity {
            let product = ProductEntity::find_by_id(line.product_id)
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?;
            let item = product
                .map(|p| p.name)
                .unwrap_or_else(|| format!("product {}", line.product_id));
            shortfalls.push(Shortfall {
                item,
                required: line.quantity,
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
