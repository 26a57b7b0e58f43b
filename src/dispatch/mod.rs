//! Action dispatcher.
//!
//! Runs only after an Approved resolution. The permitted effect set comes
//! from the live Decision — never from the caller — so nothing between the
//! proposal and execution steps can widen what fires. Every attempt is
//! recorded as an append-only ActionResult; effect failures never touch the
//! call's Approved status.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::DispatchError;
use crate::events::{CallEvent, broadcast_event};
use crate::locks::CallLocks;
use crate::models::{ActionResult, Call, CallStatus, Decision, Effect, EffectChannel, Stage};
use crate::store::StoreHandle;

/// A downstream delivery channel (email provider, CRM). Returns the external
/// reference id on success so retries can stay idempotent downstream.
#[async_trait]
pub trait EffectSender: Send + Sync {
    fn channel(&self) -> EffectChannel;

    async fn deliver(&self, call: &Call, decision: &Decision, effect: Effect) -> Result<String>;
}

/// One sender per channel.
#[derive(Clone)]
pub struct EffectSenders {
    pub email: Arc<dyn EffectSender>,
    pub crm: Arc<dyn EffectSender>,
}

impl EffectSenders {
    pub fn for_channel(&self, channel: EffectChannel) -> &Arc<dyn EffectSender> {
        match channel {
            EffectChannel::Email => &self.email,
            EffectChannel::Crm => &self.crm,
        }
    }
}

/// Webhook-backed sender; posts the effect and expects `{"external_ref": ...}`.
pub struct HttpEffectSender {
    channel: EffectChannel,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEffectSender {
    pub fn new(channel: EffectChannel, endpoint: impl Into<String>) -> Self {
        Self {
            channel,
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EffectSender for HttpEffectSender {
    fn channel(&self) -> EffectChannel {
        self.channel
    }

    async fn deliver(&self, call: &Call, decision: &Decision, effect: Effect) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct DeliveryResponse {
            external_ref: String,
        }

        let body = json!({
            "call_id": call.id,
            "effect": effect,
            "recipient": decision.recipient,
            "crm_payload": decision.crm_payload,
            "rationale": decision.rationale,
        });
        let response: DeliveryResponse = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} delivery request failed", self.channel))?
            .error_for_status()
            .with_context(|| format!("{} delivery rejected", self.channel))?
            .json()
            .await
            .with_context(|| format!("invalid {} delivery response", self.channel))?;
        Ok(response.external_ref)
    }
}

pub struct ActionDispatcher {
    store: StoreHandle,
    senders: EffectSenders,
    locks: CallLocks,
    events: broadcast::Sender<String>,
}

impl ActionDispatcher {
    pub fn new(
        store: StoreHandle,
        senders: EffectSenders,
        locks: CallLocks,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            store,
            senders,
            locks,
            events,
        }
    }

    /// Fire the permitted effects for an approved call.
    ///
    /// `requested` narrows the set for manual retries; anything in it that
    /// the Decision does not sanction is silently not executed. Effects that
    /// already succeeded are skipped, failed ones are retried independently,
    /// and every attempt appends an ActionResult whatever its outcome.
    pub async fn dispatch(
        &self,
        call_id: Uuid,
        requested: Option<Vec<Effect>>,
    ) -> Result<Vec<ActionResult>, DispatchError> {
        let _guard = self.locks.acquire(call_id).await;

        let call = self
            .store
            .call(move |s| s.get_call(call_id))
            .await?
            .ok_or(DispatchError::CallNotFound { call_id })?;
        if call.status != CallStatus::Approved {
            return Err(DispatchError::NotApproved {
                call_id,
                status: call.status,
            });
        }

        let decision = self
            .store
            .call(move |s| s.live_artifact(call_id, Stage::Decide))
            .await?
            .and_then(|a| a.payload.as_decision().cloned())
            .ok_or(DispatchError::NoDecision { call_id })?;

        let to_run: Vec<Effect> = match &requested {
            Some(req) => decision
                .effects
                .iter()
                .copied()
                .filter(|e| req.contains(e))
                .collect(),
            None => decision.effects.clone(),
        };
        if let Some(req) = &requested {
            for effect in req {
                if !decision.effects.contains(effect) {
                    warn!(%call_id, %effect, "requested effect not sanctioned by decision, skipping");
                }
            }
        }

        let already_succeeded: HashSet<Effect> = self
            .store
            .call(move |s| s.action_results(call_id))
            .await?
            .into_iter()
            .filter(|r| r.success)
            .map(|r| r.effect)
            .collect();

        let mut results = Vec::new();
        for effect in to_run {
            if already_succeeded.contains(&effect) {
                continue;
            }

            let sender = self.senders.for_channel(effect.channel());
            let outcome = sender.deliver(&call, &decision, effect).await;

            let result = match outcome {
                Ok(external_ref) => {
                    info!(%call_id, %effect, %external_ref, "effect dispatched");
                    self.store
                        .call(move |s| {
                            s.append_action_result(
                                call_id,
                                effect,
                                Some(&external_ref),
                                true,
                                None,
                            )
                        })
                        .await?
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    warn!(%call_id, %effect, error = %message, "effect dispatch failed");
                    self.store
                        .call(move |s| {
                            s.append_action_result(call_id, effect, None, false, Some(&message))
                        })
                        .await?
                }
            };

            broadcast_event(
                &self.events,
                &CallEvent::EffectDispatched {
                    result: result.clone(),
                },
            );
            results.push(result);
        }

        Ok(results)
    }
}
