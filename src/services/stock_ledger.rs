use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, JoinType, ModelTrait, Order, QueryFilter, QueryOrder, QuerySelect, RelationTrait,
    TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::{
    db,
    entities::{
        location::{self, Entity as LocationEntity},
        material::{self, Entity as MaterialEntity},
        stock_balance::{self, Entity as StockBalanceEntity},
        stock_movement::{self, Entity as StockMovementEntity, MovementKind},
        warehouse::{self, Entity as WarehouseEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// A ledger write request.
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub material_id: i64,
    pub location_id: i64,
    pub kind: MovementKind,
    pub quantity: Decimal,
    /// Defaults to now.
    pub occurred_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub recorded_by: Option<String>,
}

/// Changes applied by [`StockLedgerService::amend`]. Unset fields keep the
/// movement's current value.
#[derive(Debug, Clone, Default)]
pub struct AmendMovement {
    pub kind: Option<MovementKind>,
    pub quantity: Option<Decimal>,
    pub note: Option<String>,
}

/// Filter for the movement history query; all fields optional.
#[derive(Debug, Clone, Default)]
pub struct MovementHistoryFilter {
    pub material_id: Option<i64>,
    pub location_id: Option<i64>,
    pub kind: Option<MovementKind>,
    pub occurred_from: Option<DateTime<Utc>>,
    pub occurred_until: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

/// Per-material roll-up across every location of a tenant.
#[derive(Debug, Clone)]
pub struct MaterialStockSummary {
    pub material_id: i64,
    pub material_name: String,
    pub total_quantity: Decimal,
    pub total_reorder_minimum: Decimal,
}

impl MaterialStockSummary {
    pub fn below_minimum(&self) -> bool {
        self.total_quantity <= self.total_reorder_minimum
    }
}

/// The stock-movement ledger.
///
/// Every write keeps invariant I1: the balance row for a `(location,
/// material)` pair equals the sum of the signed quantities of that pair's
/// movements. Movement insert/update/delete and the balance adjustment
/// always share one transaction, with the balance row read under an
/// exclusive row lock so concurrent writers on the same pair serialize.
#[derive(Clone)]
pub struct StockLedgerService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl StockLedgerService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Records one movement and applies its signed quantity to the balance.
    #[instrument(skip(self))]
    pub async fn record(&self, new: NewMovement) -> Result<stock_movement::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let (movement, balance) = apply_new_movement(&txn, &new).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("stock.movements.recorded", 1);
        self.emit_recorded(&movement, &balance).await;

        info!(
            movement_id = movement.id,
            material_id = movement.material_id,
            location_id = movement.location_id,
            kind = %movement.kind,
            balance = %balance.quantity,
            "stock movement recorded"
        );

        Ok(movement)
    }

    /// Records several movements in one all-or-nothing transaction (e.g. all
    /// the lines of a supplier invoice).
    #[instrument(skip(self, movements), fields(count = movements.len()))]
    pub async fn record_many(
        &self,
        movements: Vec<NewMovement>,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        if movements.is_empty() {
            return Ok(Vec::new());
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut recorded = Vec::with_capacity(movements.len());
        for new in &movements {
            let applied = apply_new_movement(&txn, new).await?;
            recorded.push(applied);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("stock.movements.recorded", recorded.len() as u64);
        for (movement, balance) in &recorded {
            self.emit_recorded(movement, balance).await;
        }

        Ok(recorded.into_iter().map(|(m, _)| m).collect())
    }

    /// Rewrites a movement. The balance receives the delta between the old
    /// and new signed contributions, so it ends up exactly as if the
    /// movement had been recorded with the new values from the start.
    #[instrument(skip(self))]
    pub async fn amend(
        &self,
        movement_id: i64,
        changes: AmendMovement,
    ) -> Result<stock_movement::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let movement = find_movement_locked(&txn, movement_id).await?;
        let old_signed = signed_quantity(&movement)?;

        let new_kind = changes.kind.unwrap_or(parse_kind(&movement)?);
        let new_quantity = changes.quantity.unwrap_or(movement.quantity);
        if new_quantity <= Decimal::ZERO {
            return Err(ServiceError::InvalidMovement(format!(
                "quantity must be positive, got {}",
                new_quantity
            )));
        }

        let delta = new_kind.signed(new_quantity) - old_signed;
        let (material_id, location_id) = (movement.material_id, movement.location_id);

        let mut active: stock_movement::ActiveModel = movement.into();
        active.kind = Set(new_kind.as_ref().to_string());
        active.quantity = Set(new_quantity);
        if let Some(note) = changes.note {
            active.note = Set(Some(note));
        }
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        let balance = adjust_balance(&txn, location_id, material_id, delta).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("stock.movements.amended", 1);
        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::MovementAmended {
                    movement_id: updated.id,
                    material_id,
                    location_id,
                    balance: balance.quantity,
                })
                .await;
        }

        Ok(updated)
    }

    /// Deletes a movement, reversing its effect on the balance first.
    #[instrument(skip(self))]
    pub async fn retract(&self, movement_id: i64) -> Result<(), ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let movement = find_movement_locked(&txn, movement_id).await?;
        let old_signed = signed_quantity(&movement)?;
        let (material_id, location_id) = (movement.material_id, movement.location_id);

        let balance = adjust_balance(&txn, location_id, material_id, -old_signed).await?;

        movement.delete(&txn).await.map_err(|e| {
            error!("failed to delete movement {}: {}", movement_id, e);
            ServiceError::db_error(e)
        })?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("stock.movements.retracted", 1);
        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::MovementRetracted {
                    movement_id,
                    material_id,
                    location_id,
                    balance: balance.quantity,
                })
                .await;
        }

        Ok(())
    }

    /// Sets the reorder threshold on a `(location, material)` balance row,
    /// creating the row at zero stock when it does not exist yet.
    #[instrument(skip(self))]
    pub async fn set_reorder_minimum(
        &self,
        location_id: i64,
        material_id: i64,
        reorder_minimum: Decimal,
    ) -> Result<stock_balance::Model, ServiceError> {
        if reorder_minimum < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "reorder minimum cannot be negative, got {}",
                reorder_minimum
            )));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let existing = balance_row_locked(&txn, location_id, material_id).await?;
        let updated = match existing {
            Some(row) => {
                let mut active: stock_balance::ActiveModel = row.into();
                active.reorder_minimum = Set(reorder_minimum);
                active.updated_at = Set(Utc::now());
                active.update(&txn).await.map_err(ServiceError::db_error)?
            }
            None => stock_balance::ActiveModel {
                location_id: Set(location_id),
                material_id: Set(material_id),
                quantity: Set(Decimal::ZERO),
                reorder_minimum: Set(reorder_minimum),
                updated_at: Set(Utc::now()),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?,
        };

        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(updated)
    }

    /// Current balance for one `(location, material)` pair; zero when no
    /// movement has ever touched the pair.
    #[instrument(skip(self))]
    pub async fn balance(
        &self,
        location_id: i64,
        material_id: i64,
    ) -> Result<Decimal, ServiceError> {
        let row = StockBalanceEntity::find()
            .filter(stock_balance::Column::LocationId.eq(location_id))
            .filter(stock_balance::Column::MaterialId.eq(material_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(row.map(|r| r.quantity).unwrap_or(Decimal::ZERO))
    }

    /// Aggregate balance of a material across every location of a warehouse.
    #[instrument(skip(self))]
    pub async fn warehouse_balance(
        &self,
        warehouse_id: i64,
        material_id: i64,
    ) -> Result<Decimal, ServiceError> {
        warehouse_balance_in(&*self.db, warehouse_id, material_id).await
    }

    /// Per-material totals across a tenant's warehouses, with the aggregate
    /// reorder threshold, for the stock report.
    #[instrument(skip(self))]
    pub async fn tenant_stock_summary(
        &self,
        tenant_id: i64,
    ) -> Result<Vec<MaterialStockSummary>, ServiceError> {
        let db = &*self.db;

        let materials = MaterialEntity::find()
            .filter(material::Column::TenantId.eq(tenant_id))
            .order_by(material::Column::Name, Order::Asc)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let balances = StockBalanceEntity::find()
            .join(JoinType::InnerJoin, stock_balance::Relation::Location.def())
            .join(JoinType::InnerJoin, location::Relation::Warehouse.def())
            .filter(warehouse::Column::TenantId.eq(tenant_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut totals: HashMap<i64, (Decimal, Decimal)> = HashMap::new();
        for balance in balances {
            let entry = totals
                .entry(balance.material_id)
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            entry.0 += balance.quantity;
            entry.1 += balance.reorder_minimum;
        }

        Ok(materials
            .into_iter()
            .map(|m| {
                let (total_quantity, total_reorder_minimum) =
                    totals.get(&m.id).copied().unwrap_or((Decimal::ZERO, Decimal::ZERO));
                MaterialStockSummary {
                    material_id: m.id,
                    material_name: m.name,
                    total_quantity,
                    total_reorder_minimum,
                }
            })
            .collect())
    }

    /// Movement history, newest first, narrowed by the filter.
    #[instrument(skip(self))]
    pub async fn movement_history(
        &self,
        filter: MovementHistoryFilter,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        let mut query = StockMovementEntity::find();

        if let Some(material_id) = filter.material_id {
            query = query.filter(stock_movement::Column::MaterialId.eq(material_id));
        }
        if let Some(location_id) = filter.location_id {
            query = query.filter(stock_movement::Column::LocationId.eq(location_id));
        }
        if let Some(kind) = filter.kind {
            query = query.filter(stock_movement::Column::Kind.eq(kind.as_ref()));
        }
        if let Some(from) = filter.occurred_from {
            query = query.filter(stock_movement::Column::OccurredAt.gte(from));
        }
        if let Some(until) = filter.occurred_until {
            query = query.filter(stock_movement::Column::OccurredAt.lte(until));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        query
            .order_by(stock_movement::Column::OccurredAt, Order::Desc)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn emit_recorded(&self, movement: &stock_movement::Model, balance: &stock_balance::Model) {
        let Some(sender) = &self.event_sender else {
            return;
        };

        sender
            .send_or_log(Event::MovementRecorded {
                movement_id: movement.id,
                material_id: movement.material_id,
                location_id: movement.location_id,
                kind: movement.kind.clone(),
                quantity: movement.quantity,
                balance: balance.quantity,
            })
            .await;

        // Outbound writes that land at or below the threshold raise the
        // reorder alert.
        let outbound = movement
            .movement_kind()
            .map(|k| !k.is_inbound())
            .unwrap_or(false);
        if outbound && balance.below_minimum() {
            sender
                .send_or_log(Event::LowStockDetected {
                    material_id: movement.material_id,
                    location_id: movement.location_id,
                    quantity: balance.quantity,
                    reorder_minimum: balance.reorder_minimum,
                })
                .await;
        }
    }
}

/// Inserts a movement and applies its signed quantity to the balance row,
/// inside the caller's transaction. The production engine reuses this for
/// its consumption draws so the whole order shares one transaction.
pub(crate) async fn apply_new_movement<C: ConnectionTrait>(
    conn: &C,
    new: &NewMovement,
) -> Result<(stock_movement::Model, stock_balance::Model), ServiceError> {
    validate_movement(conn, new).await?;

    let movement = stock_movement::ActiveModel {
        material_id: Set(new.material_id),
        location_id: Set(new.location_id),
        kind: Set(new.kind.as_ref().to_string()),
        quantity: Set(new.quantity),
        occurred_at: Set(new.occurred_at.unwrap_or_else(Utc::now)),
        note: Set(new.note.clone()),
        recorded_by: Set(new.recorded_by.clone()),
        ..Default::default()
    }
    .insert(conn)
    .await
    .map_err(|e| {
        error!("failed to insert stock movement: {}", e);
        ServiceError::db_error(e)
    })?;

    let balance = adjust_balance(
        conn,
        new.location_id,
        new.material_id,
        new.kind.signed(new.quantity),
    )
    .await?;

    Ok((movement, balance))
}

/// Rejects malformed writes before anything is persisted: non-positive
/// quantities, unknown locations, and locations outside the material's
/// tenant.
async fn validate_movement<C: ConnectionTrait>(
    conn: &C,
    new: &NewMovement,
) -> Result<(), ServiceError> {
    if new.quantity <= Decimal::ZERO {
        return Err(ServiceError::InvalidMovement(format!(
            "quantity must be positive, got {}",
            new.quantity
        )));
    }

    let material = MaterialEntity::find_by_id(new.material_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("material {} not found", new.material_id)))?;

    let location = LocationEntity::find_by_id(new.location_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::InvalidMovement(format!("unknown location {}", new.location_id))
        })?;

    let warehouse = WarehouseEntity::find_by_id(location.warehouse_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::InternalError(format!(
                "location {} references missing warehouse {}",
                location.id, location.warehouse_id
            ))
        })?;

    if warehouse.tenant_id != material.tenant_id {
        return Err(ServiceError::InvalidMovement(format!(
            "location {} is outside the tenant of material {}",
            new.location_id, new.material_id
        )));
    }

    Ok(())
}

/// Locks (or creates) the balance row for the pair and adds `delta` to it.
/// The exclusive read is what serializes concurrent writers on one pair.
async fn adjust_balance<C: ConnectionTrait>(
    conn: &C,
    location_id: i64,
    material_id: i64,
    delta: Decimal,
) -> Result<stock_balance::Model, ServiceError> {
    let existing = balance_row_locked(conn, location_id, material_id).await?;

    match existing {
        Some(row) => {
            let new_quantity = row.quantity + delta;
            let mut active: stock_balance::ActiveModel = row.into();
            active.quantity = Set(new_quantity);
            active.updated_at = Set(Utc::now());
            active.update(conn).await.map_err(ServiceError::db_error)
        }
        None => stock_balance::ActiveModel {
            location_id: Set(location_id),
            material_id: Set(material_id),
            quantity: Set(delta),
            reorder_minimum: Set(Decimal::ZERO),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(|e| {
            // A concurrent creator loses here on the unique index; the
            // operation fails whole and is safe to retry.
            error!("failed to create stock balance row: {}", e);
            ServiceError::db_error(e)
        }),
    }
}

async fn balance_row_locked<C: ConnectionTrait>(
    conn: &C,
    location_id: i64,
    material_id: i64,
) -> Result<Option<stock_balance::Model>, ServiceError> {
    let mut query = StockBalanceEntity::find()
        .filter(stock_balance::Column::LocationId.eq(location_id))
        .filter(stock_balance::Column::MaterialId.eq(material_id));
    if db::backend_supports_row_locks(conn.get_database_backend()) {
        query = query.lock_exclusive();
    }
    query.one(conn).await.map_err(ServiceError::db_error)
}

async fn find_movement_locked<C: ConnectionTrait>(
    conn: &C,
    movement_id: i64,
) -> Result<stock_movement::Model, ServiceError> {
    let mut query =
        StockMovementEntity::find().filter(stock_movement::Column::Id.eq(movement_id));
    if db::backend_supports_row_locks(conn.get_database_backend()) {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("stock movement {} not found", movement_id)))
}

/// Aggregate balance of a material across a warehouse, usable both on the
/// pool and inside an engine transaction.
pub(crate) async fn warehouse_balance_in<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: i64,
    material_id: i64,
) -> Result<Decimal, ServiceError> {
    let rows = StockBalanceEntity::find()
        .filter(stock_balance::Column::MaterialId.eq(material_id))
        .join(JoinType::InnerJoin, stock_balance::Relation::Location.def())
        .filter(location::Column::WarehouseId.eq(warehouse_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(rows.iter().map(|r| r.quantity).sum())
}

fn parse_kind(movement: &stock_movement::Model) -> Result<MovementKind, ServiceError> {
    movement.movement_kind().map_err(|_| {
        ServiceError::InternalError(format!(
            "unknown movement kind '{}' on movement {}",
            movement.kind, movement.id
        ))
    })
}

fn signed_quantity(movement: &stock_movement::Model) -> Result<Decimal, ServiceError> {
    Ok(parse_kind(movement)?.signed(movement.quantity))
}
