//! Stage executors.
//!
//! Every analysis backend — speech engine, NLP model, LLM — satisfies the
//! single [`StageEngine`] capability: one `execute` method from prior
//! artifacts to a new payload. The orchestrator never knows which backend is
//! behind a stage, so any of the four kinds can be substituted, mocked, or
//! versioned independently.

mod http;
pub mod retry;

pub use http::HttpEngine;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::models::{ArtifactPayload, Call, ContextDoc, Stage, StageArtifact};

/// Everything an executor is allowed to see: the call, artifacts of stages
/// already completed (no forward references), the context documents for
/// stages that consult them, and an optional debug input override.
pub struct EngineRequest<'a> {
    pub call: &'a Call,
    pub prior: &'a [StageArtifact],
    pub context: &'a [ContextDoc],
    pub input: Option<&'a serde_json::Value>,
}

/// A backend that can execute one stage kind.
#[async_trait]
pub trait StageEngine: Send + Sync {
    /// Which stage this engine serves.
    fn stage(&self) -> Stage;

    /// Version identifier recorded on every artifact this engine produces.
    fn version(&self) -> &str;

    /// Run the stage. The orchestrator imposes no timeout of its own;
    /// timeout policy belongs to the engine and surfaces as
    /// [`EngineError::Transient`].
    async fn execute(&self, req: EngineRequest<'_>) -> Result<ArtifactPayload, EngineError>;
}

/// One engine per stage kind.
#[derive(Clone)]
pub struct EngineSet {
    pub transcribe: Arc<dyn StageEngine>,
    pub analyze: Arc<dyn StageEngine>,
    pub infer: Arc<dyn StageEngine>,
    pub decide: Arc<dyn StageEngine>,
}

impl EngineSet {
    pub fn for_stage(&self, stage: Stage) -> &Arc<dyn StageEngine> {
        match stage {
            Stage::Transcribe => &self.transcribe,
            Stage::Analyze => &self.analyze,
            Stage::Infer => &self.infer,
            Stage::Decide => &self.decide,
        }
    }
}
