//! Bakeline Core
//!
//! Inventory ledger, production order execution, and expiry-first (FEFO)
//! batch allocation for multi-tenant food manufacturing. This crate is the
//! persistence-backed core behind a web layer it knows nothing about: the
//! caller is expected to have resolved tenant, warehouse, and actor before
//! invoking any service here.
//!
//! The load-bearing pieces are:
//!
//! * [`services::stock_ledger`]: signed raw-material movements whose running
//!   sum defines every `(location, material)` balance,
//! * [`services::production`]: recipe-driven consumption of raw materials
//!   that emits dated finished-goods batches,
//! * [`services::sales`]: first-expiry-first-out consumption of those
//!   batches with an immutable audit trail.
//!
//! Every balance-affecting operation runs in a single database transaction
//! under row-level locks; see the service modules for the exact discipline.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod migrator;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Bundle of the core services over one shared connection pool.
///
/// The embedding application builds this once at startup and hands clones to
/// its request handlers; every service is cheaply cloneable.
#[derive(Clone)]
pub struct CoreServices {
    pub db: Arc<DatabaseConnection>,
    pub tenancy: services::tenancy::TenancyService,
    pub stock_ledger: services::stock_ledger::StockLedgerService,
    pub recipes: services::recipes::RecipeService,
    pub production: services::production::ProductionService,
    pub sales: services::sales::SalesService,
}

impl CoreServices {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<events::EventSender>) -> Self {
        Self {
            tenancy: services::tenancy::TenancyService::new(db.clone(), event_sender.clone()),
            stock_ledger: services::stock_ledger::StockLedgerService::new(
                db.clone(),
                event_sender.clone(),
            ),
            recipes: services::recipes::RecipeService::new(db.clone()),
            production: services::production::ProductionService::new(
                db.clone(),
                event_sender.clone(),
            ),
            sales: services::sales::SalesService::new(db.clone(), event_sender),
            db,
        }
    }
}
