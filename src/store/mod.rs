//! Durable keyed storage for per-call state.
//!
//! One record per call, an append-only artifact log per call, one approval
//! row at most, and an append-only action-result log. `CallStore` owns the
//! SQLite connection; [`StoreHandle`] is the async-safe wrapper the rest of
//! the crate goes through. Because every access serializes on the handle's
//! mutex and multi-row updates run inside SQLite transactions, readers only
//! ever observe fully committed state.

mod db;

pub use db::{CallStore, StoreHandle};
