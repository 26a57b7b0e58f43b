//! HTTP-backed stage engine.
//!
//! Each stage posts a JSON request to its configured endpoint and expects
//! the artifact payload back. Failure classification: timeouts, connection
//! errors, 5xx and 429 are transient; other 4xx are permanent.

use async_trait::async_trait;
use serde_json::json;

use crate::errors::EngineError;
use crate::models::{ArtifactPayload, Stage};

use super::{EngineRequest, StageEngine};

pub struct HttpEngine {
    stage: Stage,
    version: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(stage: Stage, endpoint: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            stage,
            version: version.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StageEngine for HttpEngine {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, req: EngineRequest<'_>) -> Result<ArtifactPayload, EngineError> {
        let body = json!({
            "call_id": req.call.id,
            "audio_ref": req.call.audio_ref,
            "stage": self.stage,
            "artifacts": req.prior,
            "context": req.context,
            "input": req.input,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: ArtifactPayload = response
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("invalid engine response: {}", e)))?;

        // An engine answering for the wrong stage is a contract violation,
        // not something a retry can fix.
        if payload.stage() != self.stage {
            return Err(EngineError::permanent(format!(
                "engine at {} returned a {} payload for stage {}",
                self.endpoint,
                payload.stage(),
                self.stage
            )));
        }

        Ok(payload)
    }
}
