//! Record stores for ad-spend reconciliation.
//!
//! This crate provides:
//! - `MemoryStore`, a lock-protected in-process store
//! - `SqliteStore`, a `sqlx` store with embedded migrations
//! - Repositories for typed access to each table

pub mod database;
pub mod memory;
mod models;
pub mod repositories;

pub use database::SqliteStore;
pub use memory::MemoryStore;
pub use repositories::{
    AdSpendRepository, LedgerRepository, ReconciliationRepository, Repositories,
};
