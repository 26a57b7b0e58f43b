use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::retry::{RetryConfig, compute_delay};
use crate::engine::{EngineRequest, EngineSet};
use crate::errors::{EngineError, PipelineError};
use crate::events::{CallEvent, broadcast_event};
use crate::locks::CallLocks;
use crate::models::{ArtifactPayload, Call, CallStatus, Stage, StageArtifact};
use crate::store::StoreHandle;

/// Sequences the four stage executors over a call.
///
/// All state-mutating entry points acquire the call's lock first, so two
/// workers racing on the same call id serialize. `cancel` is the exception:
/// it must land while a pipeline run holds the lock, so it goes straight to
/// the store, and the conditional writes there keep cancellation a
/// boundary-only transition.
pub struct Orchestrator {
    store: StoreHandle,
    engines: EngineSet,
    retry: RetryConfig,
    locks: CallLocks,
    events: broadcast::Sender<String>,
    persist_debug_artifacts: bool,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        engines: EngineSet,
        retry: RetryConfig,
        locks: CallLocks,
        events: broadcast::Sender<String>,
        persist_debug_artifacts: bool,
    ) -> Self {
        Self {
            store,
            engines,
            retry,
            locks,
            events,
            persist_debug_artifacts,
        }
    }

    /// Register a new call in Uploaded state without running anything.
    pub async fn create_call(&self, audio_ref: &str) -> Result<Call, PipelineError> {
        let audio_ref = audio_ref.to_string();
        let call = self
            .store
            .call(move |s| s.create_call(&audio_ref))
            .await?;
        info!(call_id = %call.id, audio_ref = %call.audio_ref, "call created");
        broadcast_event(&self.events, &CallEvent::CallCreated { call: call.clone() });
        Ok(call)
    }

    /// Full pipeline kickoff: create the call and drive it.
    pub async fn process_new(&self, audio_ref: &str) -> Result<Call, PipelineError> {
        let call = self.create_call(audio_ref).await?;
        self.process_call(call.id).await
    }

    /// Drive a call from its first incomplete stage. Idempotent: completed
    /// stages are never re-executed, and re-invoking after a failure clears
    /// the recorded error and resumes where the walk stopped.
    pub async fn process_call(&self, call_id: Uuid) -> Result<Call, PipelineError> {
        let _guard = self.locks.acquire(call_id).await;
        let mut call = self.load(call_id).await?;

        if call.status == CallStatus::Cancelled {
            return Err(PipelineError::CallCancelled { call_id });
        }
        if call.error.is_some() {
            self.store.call(move |s| s.clear_error(call_id)).await?;
            call.error = None;
        }

        while let Some(stage) = call.status.next_stage() {
            let payload = self.run_single_stage(&call, stage, None).await?;
            let engine_version = self.engines.for_stage(stage).version().to_string();
            let new_status = stage.completed_status();

            let persisted = self
                .store
                .call(move |s| {
                    s.record_stage_result(call_id, stage, &payload, &engine_version, new_status)
                })
                .await?;
            let artifact = match persisted {
                Some(a) => a,
                None => {
                    // Cancelled while the executor ran; the artifact is gone.
                    info!(%call_id, %stage, "call cancelled mid-stage, artifact discarded");
                    return Err(PipelineError::CallCancelled { call_id });
                }
            };

            info!(%call_id, %stage, artifact_id = artifact.id, "stage completed");
            broadcast_event(
                &self.events,
                &CallEvent::StageCompleted {
                    call_id,
                    stage,
                    artifact_id: artifact.id,
                },
            );
            call = self.load(call_id).await?;
        }

        if call.status == CallStatus::DecisionMade {
            let advanced = self
                .store
                .call(move |s| {
                    s.advance_status(
                        call_id,
                        CallStatus::DecisionMade,
                        CallStatus::AwaitingApproval,
                    )
                })
                .await?;
            match advanced {
                Some(updated) => {
                    call = updated;
                    info!(%call_id, "call awaiting approval");
                    broadcast_event(&self.events, &CallEvent::CallAwaitingApproval { call_id });
                }
                None => {
                    call = self.load(call_id).await?;
                }
            }
        }

        Ok(call)
    }

    /// Debug single-stage execution. The target must be either the next
    /// incomplete stage (advances the pointer) or the most recently
    /// completed one (supersede-and-retry, pointer unchanged).
    ///
    /// When debug persistence is disabled the artifact is returned with
    /// `id == 0` and nothing is written.
    pub async fn run_stage(
        &self,
        call_id: Uuid,
        stage: Stage,
        input: Option<serde_json::Value>,
    ) -> Result<StageArtifact, PipelineError> {
        let _guard = self.locks.acquire(call_id).await;
        let call = self.load(call_id).await?;

        if call.status == CallStatus::Cancelled {
            return Err(PipelineError::CallCancelled { call_id });
        }
        if call.status.is_terminal() {
            return Err(PipelineError::StageNotRunnable {
                call_id,
                stage,
                status: call.status,
            });
        }

        let advances = call.status.next_stage() == Some(stage);
        let retries_current = call.status.last_completed_stage() == Some(stage);
        if !advances && !retries_current {
            return Err(PipelineError::StageNotRunnable {
                call_id,
                stage,
                status: call.status,
            });
        }

        let payload = self.run_single_stage(&call, stage, input.as_ref()).await?;
        let engine_version = self.engines.for_stage(stage).version().to_string();

        if !self.persist_debug_artifacts {
            return Ok(StageArtifact {
                id: 0,
                call_id,
                stage,
                payload,
                engine_version,
                superseded: false,
                created_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            });
        }

        let new_status = if advances {
            stage.completed_status()
        } else {
            call.status
        };
        let persisted = self
            .store
            .call(move |s| {
                s.record_stage_result(call_id, stage, &payload, &engine_version, new_status)
            })
            .await?;
        let artifact = match persisted {
            Some(a) => a,
            None => return Err(PipelineError::CallCancelled { call_id }),
        };

        broadcast_event(
            &self.events,
            &CallEvent::StageCompleted {
                call_id,
                stage,
                artifact_id: artifact.id,
            },
        );

        if advances && new_status == CallStatus::DecisionMade {
            let advanced = self
                .store
                .call(move |s| {
                    s.advance_status(
                        call_id,
                        CallStatus::DecisionMade,
                        CallStatus::AwaitingApproval,
                    )
                })
                .await?;
            if advanced.is_some() {
                broadcast_event(&self.events, &CallEvent::CallAwaitingApproval { call_id });
            }
        }

        Ok(artifact)
    }

    /// Mark a call cancelled. Idempotent; fails `AlreadyTerminal` once the
    /// call is approved or rejected.
    pub async fn cancel(&self, call_id: Uuid) -> Result<Call, PipelineError> {
        let marked = self.store.call(move |s| s.mark_cancelled(call_id)).await?;
        match marked {
            Some(call) => {
                info!(%call_id, "call cancelled");
                broadcast_event(&self.events, &CallEvent::CallCancelled { call_id });
                Ok(call)
            }
            None => {
                let call = self.load(call_id).await?;
                if call.status == CallStatus::Cancelled {
                    Ok(call)
                } else {
                    Err(PipelineError::AlreadyTerminal {
                        call_id,
                        status: call.status,
                    })
                }
            }
        }
    }

    async fn load(&self, call_id: Uuid) -> Result<Call, PipelineError> {
        self.store
            .call(move |s| s.get_call(call_id))
            .await?
            .ok_or(PipelineError::CallNotFound { call_id })
    }

    /// Execute one stage with bounded backoff on transient errors. A failure
    /// that survives the retry budget is recorded on the call before it
    /// propagates, leaving the call resumable at its last completed stage.
    async fn run_single_stage(
        &self,
        call: &Call,
        stage: Stage,
        input: Option<&serde_json::Value>,
    ) -> Result<ArtifactPayload, PipelineError> {
        let call_id = call.id;
        let stage_index = Stage::ALL.iter().position(|s| *s == stage);

        let mut prior = self
            .store
            .call(move |s| s.live_artifacts(call_id))
            .await?;
        // Executors only ever see stages strictly before their own, even on
        // a supersede-and-retry of an already completed stage.
        prior.retain(|a| Stage::ALL.iter().position(|s| *s == a.stage) < stage_index);

        let context = if stage.uses_context() {
            self.store.call(|s| s.list_context_docs()).await?
        } else {
            Vec::new()
        };

        broadcast_event(&self.events, &CallEvent::StageStarted { call_id, stage });

        let engine = self.engines.for_stage(stage);
        let mut attempt: u32 = 0;
        loop {
            let result = engine
                .execute(EngineRequest {
                    call,
                    prior: &prior,
                    context: &context,
                    input,
                })
                .await
                .and_then(|payload| {
                    if payload.stage() != stage {
                        Err(EngineError::permanent(format!(
                            "engine returned a {} payload for stage {}",
                            payload.stage(),
                            stage
                        )))
                    } else {
                        Ok(payload)
                    }
                });

            match result {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = compute_delay(&self.retry, attempt);
                    warn!(
                        %call_id, %stage, attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient stage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let transient = err.is_transient();
                    let message = err.to_string();
                    warn!(%call_id, %stage, transient, error = %message, "stage failed");
                    {
                        let message = message.clone();
                        self.store
                            .call(move |s| s.record_error(call_id, &message))
                            .await?;
                    }
                    broadcast_event(
                        &self.events,
                        &CallEvent::StageFailed {
                            call_id,
                            stage,
                            error: message,
                            transient,
                        },
                    );
                    return Err(PipelineError::Engine {
                        call_id,
                        stage,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Decision, Effect};
    use crate::store::CallStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok_payload(stage: Stage) -> ArtifactPayload {
        match stage {
            Stage::Transcribe => ArtifactPayload::Transcript {
                text: "hello".into(),
                language: Some("en".into()),
            },
            Stage::Analyze => ArtifactPayload::Analysis {
                summary: "pricing enquiry".into(),
                sentiment: "positive".into(),
                topics: vec!["pricing".into()],
            },
            Stage::Infer => ArtifactPayload::Intelligence {
                key_points: vec!["wants enterprise plan".into()],
                risk_flags: vec![],
                references: vec![],
            },
            Stage::Decide => ArtifactPayload::Decision(Decision {
                effects: vec![Effect::SendEmail, Effect::CreateLead],
                recipient: Some("sales@example.com".into()),
                crm_payload: None,
                confidence: 0.9,
                rationale: "qualified lead".into(),
            }),
        }
    }

    /// Engine that pops scripted results; once the script is exhausted it
    /// succeeds with the canned payload for its stage.
    struct ScriptedEngine {
        stage: Stage,
        script: std::sync::Mutex<VecDeque<Result<ArtifactPayload, EngineError>>>,
        calls: AtomicU32,
    }

    impl ScriptedEngine {
        fn ok(stage: Stage) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: std::sync::Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn scripted(
            stage: Stage,
            results: Vec<Result<ArtifactPayload, EngineError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: std::sync::Mutex::new(results.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl crate::engine::StageEngine for ScriptedEngine {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn version(&self) -> &str {
            "scripted/1"
        }

        async fn execute(
            &self,
            _req: EngineRequest<'_>,
        ) -> Result<ArtifactPayload, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => Ok(ok_payload(self.stage)),
            }
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: StoreHandle,
        transcribe: Arc<ScriptedEngine>,
        analyze: Arc<ScriptedEngine>,
    }

    fn fixture_with(analyze: Arc<ScriptedEngine>, retry: RetryConfig) -> Fixture {
        let store = StoreHandle::new(CallStore::new_in_memory().unwrap());
        let transcribe = ScriptedEngine::ok(Stage::Transcribe);
        let engines = EngineSet {
            transcribe: transcribe.clone(),
            analyze: analyze.clone(),
            infer: ScriptedEngine::ok(Stage::Infer),
            decide: ScriptedEngine::ok(Stage::Decide),
        };
        let (events, _) = broadcast::channel(64);
        let orchestrator = Orchestrator::new(
            store.clone(),
            engines,
            retry,
            CallLocks::new(),
            events,
            true,
        );
        Fixture {
            orchestrator,
            store,
            transcribe,
            analyze,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedEngine::ok(Stage::Analyze), fast_retry(0))
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn test_full_pipeline_reaches_awaiting_approval() {
        let f = fixture();
        let call = f.orchestrator.process_new("s3://calls/a.wav").await.unwrap();
        assert_eq!(call.status, CallStatus::AwaitingApproval);
        assert!(call.error.is_none());

        let call_id = call.id;
        let artifacts = f
            .store
            .call(move |s| s.live_artifacts(call_id))
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 4);
        let stages: Vec<Stage> = artifacts.iter().map(|a| a.stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_transient_failure_then_resume_skips_completed_stages() {
        let analyze = ScriptedEngine::scripted(
            Stage::Analyze,
            vec![Err(EngineError::transient("simulated network drop"))],
        );
        let f = fixture_with(analyze.clone(), fast_retry(0));

        let call = f.orchestrator.create_call("s3://calls/c1.wav").await.unwrap();
        let err = f.orchestrator.process_call(call.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Engine { stage: Stage::Analyze, .. }));

        // Stuck at Transcribed with the failure recorded.
        let call_id = call.id;
        let stuck = f
            .store
            .call(move |s| s.get_call(call_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stuck.status, CallStatus::Transcribed);
        assert!(stuck.error.as_deref().unwrap().contains("network drop"));

        // Resume: transcribe must not run again, analyze retried, walk
        // completes with exactly one live artifact per stage.
        let resumed = f.orchestrator.process_call(call.id).await.unwrap();
        assert_eq!(resumed.status, CallStatus::AwaitingApproval);
        assert!(resumed.error.is_none());
        assert_eq!(f.transcribe.call_count(), 1);
        assert_eq!(analyze.call_count(), 2);

        let artifacts = f
            .store
            .call(move |s| s.artifacts(call_id))
            .await
            .unwrap();
        let transcripts: Vec<_> = artifacts
            .iter()
            .filter(|a| a.stage == Stage::Transcribe)
            .collect();
        let analyses: Vec<_> = artifacts
            .iter()
            .filter(|a| a.stage == Stage::Analyze)
            .collect();
        assert_eq!(transcripts.len(), 1);
        assert_eq!(analyses.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_in_process_with_backoff() {
        let analyze = ScriptedEngine::scripted(
            Stage::Analyze,
            vec![
                Err(EngineError::transient("503")),
                Err(EngineError::transient("503")),
            ],
        );
        let f = fixture_with(analyze.clone(), fast_retry(3));

        let call = f.orchestrator.process_new("s3://calls/a.wav").await.unwrap();
        assert_eq!(call.status, CallStatus::AwaitingApproval);
        // Two scripted failures plus the succeeding attempt.
        assert_eq!(analyze.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_halts_without_retry() {
        let analyze = ScriptedEngine::scripted(
            Stage::Analyze,
            vec![Err(EngineError::permanent("unsupported audio"))],
        );
        let f = fixture_with(analyze.clone(), fast_retry(3));

        let call = f.orchestrator.create_call("s3://calls/a.wav").await.unwrap();
        let err = f.orchestrator.process_call(call.id).await.unwrap_err();
        match err {
            PipelineError::Engine { source, .. } => assert!(!source.is_transient()),
            other => panic!("Expected Engine error, got {other:?}"),
        }
        // No in-process retry for permanent failures.
        assert_eq!(analyze.call_count(), 1);

        let call_id = call.id;
        let stuck = f
            .store
            .call(move |s| s.get_call(call_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stuck.status, CallStatus::Transcribed);
        assert!(stuck.error.is_some());
    }

    #[tokio::test]
    async fn test_process_call_is_idempotent_when_complete() {
        let f = fixture();
        let call = f.orchestrator.process_new("s3://calls/a.wav").await.unwrap();
        let again = f.orchestrator.process_call(call.id).await.unwrap();
        assert_eq!(again.status, CallStatus::AwaitingApproval);
        // No stage ran twice.
        assert_eq!(f.transcribe.call_count(), 1);
        assert_eq!(f.analyze.call_count(), 1);
    }

    #[tokio::test]
    async fn test_run_stage_advances_next_stage_only() {
        let f = fixture();
        let call = f.orchestrator.create_call("s3://calls/a.wav").await.unwrap();

        // Skipping ahead is refused.
        let err = f
            .orchestrator
            .run_stage(call.id, Stage::Analyze, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageNotRunnable { .. }));

        let artifact = f
            .orchestrator
            .run_stage(call.id, Stage::Transcribe, None)
            .await
            .unwrap();
        assert_eq!(artifact.stage, Stage::Transcribe);

        let call_id = call.id;
        let updated = f
            .store
            .call(move |s| s.get_call(call_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, CallStatus::Transcribed);
    }

    #[tokio::test]
    async fn test_run_stage_supersedes_current_stage() {
        let f = fixture();
        let call = f.orchestrator.create_call("s3://calls/a.wav").await.unwrap();
        f.orchestrator
            .run_stage(call.id, Stage::Transcribe, None)
            .await
            .unwrap();

        // Re-running the just-completed stage supersedes, pointer unchanged.
        let retried = f
            .orchestrator
            .run_stage(call.id, Stage::Transcribe, None)
            .await
            .unwrap();
        assert!(!retried.superseded);

        let call_id = call.id;
        let (status, all, live) = f
            .store
            .call(move |s| {
                let status = s.get_call(call_id)?.unwrap().status;
                Ok((status, s.artifacts(call_id)?, s.live_artifacts(call_id)?))
            })
            .await
            .unwrap();
        assert_eq!(status, CallStatus::Transcribed);
        assert_eq!(all.len(), 2);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, retried.id);
    }

    #[tokio::test]
    async fn test_run_stage_decide_advances_to_awaiting_approval() {
        let f = fixture();
        let call = f.orchestrator.create_call("s3://calls/a.wav").await.unwrap();
        for stage in Stage::ALL {
            f.orchestrator.run_stage(call.id, stage, None).await.unwrap();
        }
        let call_id = call.id;
        let updated = f
            .store
            .call(move |s| s.get_call(call_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, CallStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_run_stage_ephemeral_when_persistence_disabled() {
        let store = StoreHandle::new(CallStore::new_in_memory().unwrap());
        let engines = EngineSet {
            transcribe: ScriptedEngine::ok(Stage::Transcribe),
            analyze: ScriptedEngine::ok(Stage::Analyze),
            infer: ScriptedEngine::ok(Stage::Infer),
            decide: ScriptedEngine::ok(Stage::Decide),
        };
        let (events, _) = broadcast::channel(64);
        let orchestrator = Orchestrator::new(
            store.clone(),
            engines,
            fast_retry(0),
            CallLocks::new(),
            events,
            false,
        );

        let call = orchestrator.create_call("s3://calls/a.wav").await.unwrap();
        let artifact = orchestrator
            .run_stage(call.id, Stage::Transcribe, None)
            .await
            .unwrap();
        assert_eq!(artifact.id, 0);

        let call_id = call.id;
        let (status, artifacts) = store
            .call(move |s| Ok((s.get_call(call_id)?.unwrap().status, s.artifacts(call_id)?)))
            .await
            .unwrap();
        assert_eq!(status, CallStatus::Uploaded);
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_processing() {
        let f = fixture();
        let call = f.orchestrator.create_call("s3://calls/a.wav").await.unwrap();
        let cancelled = f.orchestrator.cancel(call.id).await.unwrap();
        assert_eq!(cancelled.status, CallStatus::Cancelled);

        // Cancel is idempotent.
        let again = f.orchestrator.cancel(call.id).await.unwrap();
        assert_eq!(again.status, CallStatus::Cancelled);

        let err = f.orchestrator.process_call(call.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::CallCancelled { .. }));
    }

    #[tokio::test]
    async fn test_unknown_call_id() {
        let f = fixture();
        let err = f.orchestrator.process_call(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::CallNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_process_calls_serialize() {
        let f = fixture_with(ScriptedEngine::ok(Stage::Analyze), fast_retry(0));
        let call = f.orchestrator.create_call("s3://calls/a.wav").await.unwrap();

        let orchestrator = Arc::new(f.orchestrator);
        let a = {
            let o = orchestrator.clone();
            let id = call.id;
            tokio::spawn(async move { o.process_call(id).await })
        };
        let b = {
            let o = orchestrator.clone();
            let id = call.id;
            tokio::spawn(async move { o.process_call(id).await })
        };
        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        assert_eq!(ra.status, CallStatus::AwaitingApproval);
        assert_eq!(rb.status, CallStatus::AwaitingApproval);

        // The loser of the race found the walk already complete; nothing
        // ran twice and each stage has exactly one artifact.
        assert_eq!(f.transcribe.call_count(), 1);
        let call_id = call.id;
        let artifacts = f
            .store
            .call(move |s| s.artifacts(call_id))
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 4);
    }
}
