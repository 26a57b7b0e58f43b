//! Human approval gate.
//!
//! A call that has reached AwaitingApproval holds there until exactly one
//! resolution lands. The single-resolution invariant survives concurrent
//! double-submission twice over: resolvers serialize on the per-call lock,
//! and the store's approval row is keyed by call id so a second insert
//! cannot land even without the lock.

use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::errors::ApprovalError;
use crate::events::{CallEvent, broadcast_event};
use crate::locks::CallLocks;
use crate::models::{ApprovalOutcome, ApprovalRecord, CallStatus};
use crate::store::StoreHandle;

pub struct ApprovalGate {
    store: StoreHandle,
    locks: CallLocks,
    events: broadcast::Sender<String>,
}

impl ApprovalGate {
    pub fn new(store: StoreHandle, locks: CallLocks, events: broadcast::Sender<String>) -> Self {
        Self {
            store,
            locks,
            events,
        }
    }

    /// Record the one human resolution for a call. The approval row and the
    /// pointer move to Approved/Rejected commit together; a successful
    /// Approved resolution is what unblocks the action dispatcher.
    pub async fn resolve(
        &self,
        call_id: Uuid,
        outcome: ApprovalOutcome,
        notes: Option<String>,
        resolved_by: Option<String>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let _guard = self.locks.acquire(call_id).await;

        let call = self
            .store
            .call(move |s| s.get_call(call_id))
            .await?
            .ok_or(ApprovalError::CallNotFound { call_id })?;

        if self
            .store
            .call(move |s| s.get_approval(call_id))
            .await?
            .is_some()
        {
            return Err(ApprovalError::AlreadyResolved { call_id });
        }
        if call.status != CallStatus::AwaitingApproval {
            return Err(ApprovalError::NotAwaitingApproval {
                call_id,
                status: call.status,
            });
        }

        let inserted = self
            .store
            .call(move |s| {
                s.insert_approval(call_id, outcome, notes.as_deref(), resolved_by.as_deref())
            })
            .await?;

        match inserted {
            Some(record) => {
                info!(%call_id, outcome = %record.outcome, "call resolved");
                broadcast_event(
                    &self.events,
                    &CallEvent::CallResolved {
                        approval: record.clone(),
                    },
                );
                Ok(record)
            }
            // The insert bounced even though the pre-checks passed: either a
            // resolution or a cancellation slipped in through the store.
            None => {
                if self
                    .store
                    .call(move |s| s.get_approval(call_id))
                    .await?
                    .is_some()
                {
                    Err(ApprovalError::AlreadyResolved { call_id })
                } else {
                    let call = self
                        .store
                        .call(move |s| s.get_call(call_id))
                        .await?
                        .ok_or(ApprovalError::CallNotFound { call_id })?;
                    Err(ApprovalError::NotAwaitingApproval {
                        call_id,
                        status: call.status,
                    })
                }
            }
        }
    }
}
