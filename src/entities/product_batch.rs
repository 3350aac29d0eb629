use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// A dated lot of finished product, created exactly once by executing a
/// production order. `available_quantity` only ever decreases after creation,
/// and only through sales confirmation.
///
/// Status is not a column: it is a pure function of `(expiry_date, today)`,
/// so a batch whose expiry passed yesterday reports `Expired` no matter when
/// it was last written. See [`BatchStatus::at`].
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_batches")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub product_id: i64,
    pub production_order_id: Option<i64>,
    pub location_id: i64,
    /// `{product_id}-{YYYYMMDD}-{seq:03}`, globally unique; the sequence is
    /// scoped to (product, production date).
    #[sea_orm(unique)]
    pub code: String,
    pub produced_at: DateTime<Utc>,
    pub expiry_date: NaiveDate,
    #[sea_orm(column_type = "Decimal(Some((12, 3)))")]
    pub initial_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 3)))")]
    pub available_quantity: Decimal,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    #[sea_orm(
        belongs_to = "super::production_order::Entity",
        from = "Column::ProductionOrderId",
        to = "super::production_order::Column::Id"
    )]
    ProductionOrder,
    #[sea_orm(
        belongs_to = "super::location::Entity",
        from = "Column::LocationId",
        to = "super::location::Column::Id"
    )]
    Location,
    #[sea_orm(has_many = "super::sales_consumption::Entity")]
    Consumptions,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::production_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProductionOrder.def()
    }
}

impl Related<super::location::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Location.def()
    }
}

impl Related<super::sales_consumption::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Consumptions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Ok,
    NearExpiry,
    Expired,
}

impl BatchStatus {
    /// Status of a batch with the given expiry date as of `today`: expired
    /// once the date has passed, near-expiry within one day of it.
    pub fn at(expiry_date: NaiveDate, today: NaiveDate) -> Self {
        let days_remaining = (expiry_date - today).num_days();
        if days_remaining < 0 {
            BatchStatus::Expired
        } else if days_remaining <= 1 {
            BatchStatus::NearExpiry
        } else {
            BatchStatus::Ok
        }
    }

    /// Expired batches are never eligible for sales allocation.
    pub fn sellable(&self) -> bool {
        !matches!(self, BatchStatus::Expired)
    }
}

impl Model {
    pub fn status(&self, today: NaiveDate) -> BatchStatus {
        BatchStatus::at(self.expiry_date, today)
    }

    pub fn days_remaining(&self, today: NaiveDate) -> i64 {
        (self.expiry_date - today).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("2024-01-09", BatchStatus::Expired)]
    #[case("2024-01-10", BatchStatus::NearExpiry)]
    #[case("2024-01-11", BatchStatus::NearExpiry)]
    #[case("2024-01-12", BatchStatus::Ok)]
    fn status_is_a_function_of_expiry_and_today(
        #[case] expiry: &str,
        #[case] expected: BatchStatus,
    ) {
        let today = day("2024-01-10");
        assert_eq!(BatchStatus::at(day(expiry), today), expected);
    }

    #[test]
    fn only_expired_batches_are_unsellable() {
        assert!(BatchStatus::Ok.sellable());
        assert!(BatchStatus::NearExpiry.sellable());
        assert!(!BatchStatus::Expired.sellable());
    }
}
