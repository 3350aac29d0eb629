//! sea-orm entities for the inventory, production, and sales core.
//!
//! Ownership is tenant-down: a tenant owns warehouses, materials, products,
//! and sales orders; warehouses own locations; locations hold stock balances
//! and finished-goods batches.

pub mod location;
pub mod material;
pub mod product;
pub mod product_batch;
pub mod production_order;
pub mod recipe;
pub mod recipe_line;
pub mod sales_consumption;
pub mod sales_order;
pub mod sales_order_line;
pub mod stock_balance;
pub mod stock_movement;
pub mod tenant;
pub mod unit_of_measure;
pub mod warehouse;
