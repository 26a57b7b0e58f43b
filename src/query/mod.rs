//! Read-only projections over stored calls.
//!
//! Every read goes through the serialized store handle, so it only observes
//! the last fully committed state — never a call mid-transaction.

use anyhow::Result;
use uuid::Uuid;

use crate::models::{CallDetail, CallFilters, Call, Metrics};
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct QuerySurface {
    store: StoreHandle,
}

impl QuerySurface {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub async fn list_calls(&self, filters: CallFilters) -> Result<Vec<Call>> {
        self.store.call(move |s| s.list_calls(&filters)).await
    }

    /// Full history for one call: artifacts (superseded included), the
    /// approval record if any, and the action audit log.
    pub async fn get_call(&self, call_id: Uuid) -> Result<Option<CallDetail>> {
        self.store.call(move |s| s.get_call_detail(call_id)).await
    }

    pub async fn metrics(&self) -> Result<Metrics> {
        self.store.call(|s| s.metrics()).await
    }
}
