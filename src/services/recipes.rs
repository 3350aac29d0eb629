use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, Order, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::{
    entities::{
        material::{self, Entity as MaterialEntity},
        product::Entity as ProductEntity,
        recipe::{self, Entity as RecipeEntity},
        recipe_line::{self, Entity as RecipeLineEntity},
    },
    errors::ServiceError,
};

/// One expanded ingredient requirement for a production run.
#[derive(Debug, Clone)]
pub struct MaterialRequirement {
    pub material_id: i64,
    pub material_name: String,
    pub required: Decimal,
}

/// Requirement of a single line for `batch_multiplier` batches. Pure
/// arithmetic: no rounding (quantities already sit in the material's base
/// unit).
pub fn required_for(line: &recipe_line::Model, batch_multiplier: Decimal) -> Decimal {
    line.quantity * batch_multiplier
}

/// Expands recipe lines by a batch multiplier. Pure; no I/O.
pub fn expand(lines: &[recipe_line::Model], batch_multiplier: Decimal) -> Vec<(i64, Decimal)> {
    lines
        .iter()
        .map(|line| (line.material_id, required_for(line, batch_multiplier)))
        .collect()
}

/// Recipe maintenance and expansion.
#[derive(Clone)]
pub struct RecipeService {
    db: Arc<DatabaseConnection>,
}

impl RecipeService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn create_recipe(
        &self,
        product_id: i64,
        name: String,
        version: i32,
        yield_per_batch: Decimal,
        description: Option<String>,
    ) -> Result<recipe::Model, ServiceError> {
        if yield_per_batch <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "yield per batch must be positive, got {}",
                yield_per_batch
            )));
        }

        let db = &*self.db;

        ProductEntity::find_by_id(product_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("product {} not found", product_id)))?;

        let created = recipe::ActiveModel {
            product_id: Set(product_id),
            name: Set(name),
            version: Set(version),
            yield_per_batch: Set(yield_per_batch),
            description: Set(description),
            active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!("failed to create recipe: {}", e);
            ServiceError::db_error(e)
        })?;

        info!(recipe_id = created.id, product_id, "recipe created");
        Ok(created)
    }

    /// Adds an ingredient line. The material must belong to the same tenant
    /// as the recipe's product; the quantity is per batch unit, in the
    /// material's base unit.
    #[instrument(skip(self))]
    pub async fn add_line(
        &self,
        recipe_id: i64,
        material_id: i64,
        quantity: Decimal,
    ) -> Result<recipe_line::Model, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "line quantity must be positive, got {}",
                quantity
            )));
        }

        let db = &*self.db;

        let recipe = RecipeEntity::find_by_id(recipe_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("recipe {} not found", recipe_id)))?;

        let product = ProductEntity::find_by_id(recipe.product_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("product {} not found", recipe.product_id))
            })?;

        let material = MaterialEntity::find_by_id(material_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("material {} not found", material_id)))?;

        if material.tenant_id != product.tenant_id {
            return Err(ServiceError::ValidationError(format!(
                "material {} belongs to a different tenant than product {}",
                material_id, product.id
            )));
        }

        let created = recipe_line::ActiveModel {
            recipe_id: Set(recipe_id),
            material_id: Set(material_id),
            quantity: Set(quantity),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!("failed to add recipe line: {}", e);
            ServiceError::db_error(e)
        })?;

        Ok(created)
    }

    /// Expanded requirements for `batch_multiplier` batches of a recipe,
    /// ordered by material name.
    #[instrument(skip(self))]
    pub async fn requirements_for(
        &self,
        recipe_id: i64,
        batch_multiplier: Decimal,
    ) -> Result<Vec<MaterialRequirement>, ServiceError> {
        requirements_in(&*self.db, recipe_id, batch_multiplier).await
    }
}

/// Transaction-aware variant of [`RecipeService::requirements_for`]; the
/// production engine calls this inside its own transaction so validation and
/// consumption see one snapshot of the recipe.
pub(crate) async fn requirements_in<C: ConnectionTrait>(
    conn: &C,
    recipe_id: i64,
    batch_multiplier: Decimal,
) -> Result<Vec<MaterialRequirement>, ServiceError> {
    let lines = RecipeLineEntity::find()
        .filter(recipe_line::Column::RecipeId.eq(recipe_id))
        .find_also_related(MaterialEntity)
        .order_by(material::Column::Name, Order::Asc)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    lines
        .into_iter()
        .map(|(line, material)| {
            let material = material.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "recipe line {} references missing material {}",
                    line.id, line.material_id
                ))
            })?;
            Ok(MaterialRequirement {
                material_id: line.material_id,
                material_name: material.name,
                required: required_for(&line, batch_multiplier),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(id: i64, material_id: i64, quantity: Decimal) -> recipe_line::Model {
        recipe_line::Model {
            id,
            recipe_id: 1,
            material_id,
            quantity,
        }
    }

    #[test]
    fn expansion_scales_every_line() {
        let lines = vec![line(1, 10, dec!(0.5)), line(2, 11, dec!(2))];
        let expanded = expand(&lines, dec!(3));
        assert_eq!(expanded, vec![(10, dec!(1.5)), (11, dec!(6))]);
    }

    #[test]
    fn expansion_of_no_lines_is_empty() {
        assert!(expand(&[], dec!(4)).is_empty());
    }

    #[test]
    fn fractional_multipliers_are_exact() {
        let lines = vec![line(1, 10, dec!(0.125))];
        assert_eq!(expand(&lines, dec!(0.5)), vec![(10, dec!(0.0625))]);
    }
}
