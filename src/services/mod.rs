//! Service layer: every public operation here runs to completion (or fails)
//! within a single caller-invoked call and owns its transaction boundary.

pub mod production;
pub mod recipes;
pub mod sales;
pub mod stock_ledger;
pub mod tenancy;
