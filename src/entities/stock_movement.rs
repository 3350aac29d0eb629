use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// One ledger entry. Quantity is stored unsigned; the sign is a function of
/// the kind (see [`MovementKind::signed`]).
///
/// Movements are logically append-only. Amending or retracting one goes
/// through `services::stock_ledger`, which reverses the old contribution on
/// the balance before applying the new one.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub material_id: i64,
    pub location_id: i64,
    /// Movement kind string; parse with [`MovementKind`].
    pub kind: String,
    #[sea_orm(column_type = "Decimal(Some((12, 3)))")]
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub note: Option<String>,
    pub recorded_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::material::Entity",
        from = "Column::MaterialId",
        to = "super::material::Column::Id"
    )]
    Material,
    #[sea_orm(
        belongs_to = "super::location::Entity",
        from = "Column::LocationId",
        to = "super::location::Column::Id"
    )]
    Location,
}

impl Related<super::material::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Material.def()
    }
}

impl Related<super::location::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Location.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Receipt,
    Consumption,
    AdjustPos,
    AdjustNeg,
    Shrinkage,
}

impl MovementKind {
    /// Receipts and positive adjustments add stock; everything else removes.
    pub fn is_inbound(&self) -> bool {
        matches!(self, MovementKind::Receipt | MovementKind::AdjustPos)
    }

    /// The signed contribution of a movement of this kind to its balance.
    pub fn signed(&self, quantity: Decimal) -> Decimal {
        if self.is_inbound() {
            quantity
        } else {
            -quantity
        }
    }
}

impl Model {
    pub fn movement_kind(&self) -> Result<MovementKind, strum::ParseError> {
        self.kind.parse()
    }

    /// Signed contribution of this row to its `(location, material)` balance.
    pub fn signed_quantity(&self) -> Result<Decimal, strum::ParseError> {
        Ok(self.movement_kind()?.signed(self.quantity))
    }
}
