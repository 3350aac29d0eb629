use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter,
};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::{
    entities::{
        location,
        tenant::{self, Entity as TenantEntity, PlanTier},
        warehouse::{self, Entity as WarehouseEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// How many warehouses a plan allows. Single-warehouse tiers allow exactly
/// one; checked at creation time only, never retroactively.
pub fn allows_new_warehouse(plan: PlanTier, existing_warehouses: u64) -> bool {
    match plan {
        PlanTier::Essential | PlanTier::Traceability => existing_warehouses == 0,
        PlanTier::MultiSite => true,
    }
}

/// How many locations a plan allows within one warehouse.
pub fn allows_new_location(plan: PlanTier, existing_in_warehouse: u64) -> bool {
    match plan {
        PlanTier::Essential => existing_in_warehouse == 0,
        PlanTier::Traceability | PlanTier::MultiSite => true,
    }
}

/// Tenant/warehouse/location maintenance with plan-limit enforcement.
#[derive(Clone)]
pub struct TenancyService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl TenancyService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn create_tenant(
        &self,
        name: String,
        plan: PlanTier,
    ) -> Result<tenant::Model, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "tenant name cannot be empty".to_string(),
            ));
        }

        let db = &*self.db;
        let created = tenant::ActiveModel {
            name: Set(name),
            plan: Set(plan.as_ref().to_string()),
            subscription_status: Set("trialing".to_string()),
            onboarding_complete: Set(false),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!("failed to create tenant: {}", e);
            ServiceError::db_error(e)
        })?;

        info!(tenant_id = created.id, plan = %created.plan, "tenant created");
        Ok(created)
    }

    /// Creates a warehouse, enforcing the tenant's plan limit.
    #[instrument(skip(self))]
    pub async fn create_warehouse(
        &self,
        tenant_id: i64,
        name: String,
        address: Option<String>,
        is_primary: bool,
    ) -> Result<warehouse::Model, ServiceError> {
        let db = &*self.db;

        let tenant = TenantEntity::find_by_id(tenant_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("tenant {} not found", tenant_id)))?;
        let plan = tenant.plan_tier().map_err(|_| {
            ServiceError::InternalError(format!("unknown plan '{}' on tenant {}", tenant.plan, tenant.id))
        })?;

        let existing = WarehouseEntity::find()
            .filter(warehouse::Column::TenantId.eq(tenant_id))
            .count(db)
            .await
            .map_err(ServiceError::db_error)?;

        if !allows_new_warehouse(plan, existing) {
            return Err(ServiceError::PlanLimitExceeded(format!(
                "plan {} allows a single warehouse",
                plan
            )));
        }

        let created = warehouse::ActiveModel {
            tenant_id: Set(tenant_id),
            name: Set(name),
            address: Set(address),
            is_primary: Set(is_primary),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!("failed to create warehouse: {}", e);
            ServiceError::db_error(e)
        })?;

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::WarehouseCreated {
                    warehouse_id: created.id,
                    tenant_id,
                })
                .await;
        }

        info!(warehouse_id = created.id, tenant_id, "warehouse created");
        Ok(created)
    }

    /// Creates a location within a warehouse, enforcing the tenant's plan
    /// limit on locations per warehouse.
    #[instrument(skip(self))]
    pub async fn create_location(
        &self,
        warehouse_id: i64,
        name: String,
    ) -> Result<location::Model, ServiceError> {
        let db = &*self.db;

        let warehouse = WarehouseEntity::find_by_id(warehouse_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("warehouse {} not found", warehouse_id))
            })?;

        let tenant = TenantEntity::find_by_id(warehouse.tenant_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("tenant {} not found", warehouse.tenant_id))
            })?;
        let plan = tenant.plan_tier().map_err(|_| {
            ServiceError::InternalError(format!("unknown plan '{}' on tenant {}", tenant.plan, tenant.id))
        })?;

        let existing = location::Entity::find()
            .filter(location::Column::WarehouseId.eq(warehouse_id))
            .count(db)
            .await
            .map_err(ServiceError::db_error)?;

        if !allows_new_location(plan, existing) {
            return Err(ServiceError::PlanLimitExceeded(format!(
                "plan {} allows a single location per warehouse",
                plan
            )));
        }

        let created = location::ActiveModel {
            warehouse_id: Set(warehouse_id),
            name: Set(name),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!("failed to create location: {}", e);
            ServiceError::db_error(e)
        })?;

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::LocationCreated {
                    location_id: created.id,
                    warehouse_id,
                })
                .await;
        }

        info!(location_id = created.id, warehouse_id, "location created");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_warehouse_plans_cap_at_one() {
        assert!(allows_new_warehouse(PlanTier::Essential, 0));
        assert!(!allows_new_warehouse(PlanTier::Essential, 1));
        assert!(allows_new_warehouse(PlanTier::Traceability, 0));
        assert!(!allows_new_warehouse(PlanTier::Traceability, 1));
        assert!(allows_new_warehouse(PlanTier::MultiSite, 7));
    }

    #[test]
    fn only_essential_caps_locations_per_warehouse() {
        assert!(allows_new_location(PlanTier::Essential, 0));
        assert!(!allows_new_location(PlanTier::Essential, 1));
        assert!(allows_new_location(PlanTier::Traceability, 5));
        assert!(allows_new_location(PlanTier::MultiSite, 5));
    }
}
