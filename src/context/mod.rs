//! Context store.
//!
//! Free-text policy documents plus tag metadata, consulted read-only by the
//! Infer and Decide stages. Loosely coupled: the pipeline only ever reads.

use anyhow::Result;

use crate::models::ContextDoc;
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct ContextStore {
    store: StoreHandle,
}

impl ContextStore {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub async fn add_doc(&self, title: &str, body: &str, tags: Vec<String>) -> Result<ContextDoc> {
        let title = title.to_string();
        let body = body.to_string();
        self.store
            .call(move |s| s.add_context_doc(&title, &body, &tags))
            .await
    }

    pub async fn list_docs(&self) -> Result<Vec<ContextDoc>> {
        self.store.call(|s| s.list_context_docs()).await
    }

    /// Documents carrying at least one of the given tags. With no tags the
    /// whole corpus is returned.
    pub async fn docs_tagged(&self, tags: Vec<String>) -> Result<Vec<ContextDoc>> {
        let docs = self.list_docs().await?;
        if tags.is_empty() {
            return Ok(docs);
        }
        Ok(docs
            .into_iter()
            .filter(|d| d.tags.iter().any(|t| tags.contains(t)))
            .collect())
    }
}
