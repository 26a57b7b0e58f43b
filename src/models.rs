use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the four ordered analysis steps a call passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcribe,
    Analyze,
    Infer,
    Decide,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Transcribe,
        Stage::Analyze,
        Stage::Infer,
        Stage::Decide,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Analyze => "analyze",
            Self::Infer => "infer",
            Self::Decide => "decide",
        }
    }

    /// The call status a successful run of this stage advances to.
    pub fn completed_status(&self) -> CallStatus {
        match self {
            Self::Transcribe => CallStatus::Transcribed,
            Self::Analyze => CallStatus::Analyzed,
            Self::Infer => CallStatus::IntelligenceGenerated,
            Self::Decide => CallStatus::DecisionMade,
        }
    }

    /// Whether this stage consults the context store when executing.
    pub fn uses_context(&self) -> bool {
        matches!(self, Self::Infer | Self::Decide)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(Self::Transcribe),
            "analyze" => Ok(Self::Analyze),
            "infer" => Ok(Self::Infer),
            "decide" => Ok(Self::Decide),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// The stage pointer for a call. Advances forward through the fixed walk
/// and never skips; `cancelled` is the only exit outside the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Uploaded,
    Transcribed,
    Analyzed,
    IntelligenceGenerated,
    DecisionMade,
    AwaitingApproval,
    Approved,
    Rejected,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Transcribed => "transcribed",
            Self::Analyzed => "analyzed",
            Self::IntelligenceGenerated => "intelligence_generated",
            Self::DecisionMade => "decision_made",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Position in the fixed walk. Cancelled sorts last so the pointer
    /// comparison in `record_stage_result` never moves a call out of it.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Uploaded => 0,
            Self::Transcribed => 1,
            Self::Analyzed => 2,
            Self::IntelligenceGenerated => 3,
            Self::DecisionMade => 4,
            Self::AwaitingApproval => 5,
            Self::Approved => 6,
            Self::Rejected => 6,
            Self::Cancelled => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }

    /// The first incomplete stage, i.e. what the pipeline runs next.
    /// None once the analysis walk is done (or the call exited it).
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            Self::Uploaded => Some(Stage::Transcribe),
            Self::Transcribed => Some(Stage::Analyze),
            Self::Analyzed => Some(Stage::Infer),
            Self::IntelligenceGenerated => Some(Stage::Decide),
            Self::DecisionMade
            | Self::AwaitingApproval
            | Self::Approved
            | Self::Rejected
            | Self::Cancelled => None,
        }
    }

    /// The most recently completed stage, eligible for supersede-and-retry.
    pub fn last_completed_stage(&self) -> Option<Stage> {
        match self {
            Self::Uploaded | Self::Cancelled => None,
            Self::Transcribed => Some(Stage::Transcribe),
            Self::Analyzed => Some(Stage::Analyze),
            Self::IntelligenceGenerated => Some(Stage::Infer),
            Self::DecisionMade | Self::AwaitingApproval | Self::Approved | Self::Rejected => {
                Some(Stage::Decide)
            }
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "transcribed" => Ok(Self::Transcribed),
            "analyzed" => Ok(Self::Analyzed),
            "intelligence_generated" => Ok(Self::IntelligenceGenerated),
            "decision_made" => Ok(Self::DecisionMade),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid call status: {}", s)),
        }
    }
}

/// A recorded call being driven through the pipeline.
///
/// `error` holds the last stage failure for calls stuck mid-walk; it is
/// cleared when processing resumes. A non-terminal call with an error set
/// is waiting on either a retry or human intervention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub audio_ref: String,
    pub status: CallStatus,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A downstream effect a Decision may propose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    SendEmail,
    CreateLead,
    LogActivity,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::CreateLead => "create_lead",
            Self::LogActivity => "log_activity",
        }
    }

    /// Which delivery channel carries this effect.
    pub fn channel(&self) -> EffectChannel {
        match self {
            Self::SendEmail => EffectChannel::Email,
            Self::CreateLead | Self::LogActivity => EffectChannel::Crm,
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_email" => Ok(Self::SendEmail),
            "create_lead" => Ok(Self::CreateLead),
            "log_activity" => Ok(Self::LogActivity),
            _ => Err(format!("Invalid effect: {}", s)),
        }
    }
}

/// Delivery channel for an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectChannel {
    Email,
    Crm,
}

impl EffectChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Crm => "crm",
        }
    }
}

impl std::fmt::Display for EffectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The Decide stage output: what the system proposes to do, pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Effects this decision sanctions. The dispatcher never fires anything
    /// outside this set, whatever the caller requests.
    pub effects: Vec<Effect>,
    pub recipient: Option<String>,
    pub crm_payload: Option<serde_json::Value>,
    pub confidence: f64,
    pub rationale: String,
}

/// The persisted output of one stage for one call, tagged by stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactPayload {
    Transcript {
        text: String,
        language: Option<String>,
    },
    Analysis {
        summary: String,
        sentiment: String,
        topics: Vec<String>,
    },
    Intelligence {
        key_points: Vec<String>,
        risk_flags: Vec<String>,
        references: Vec<String>,
    },
    Decision(Decision),
}

impl ArtifactPayload {
    /// The stage this payload kind belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Transcript { .. } => Stage::Transcribe,
            Self::Analysis { .. } => Stage::Analyze,
            Self::Intelligence { .. } => Stage::Infer,
            Self::Decision(_) => Stage::Decide,
        }
    }

    pub fn as_decision(&self) -> Option<&Decision> {
        match self {
            Self::Decision(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageArtifact {
    pub id: i64,
    pub call_id: Uuid,
    pub stage: Stage,
    pub payload: ArtifactPayload,
    pub engine_version: String,
    pub superseded: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn call_status(&self) -> CallStatus {
        match self {
            Self::Approved => CallStatus::Approved,
            Self::Rejected => CallStatus::Rejected,
        }
    }
}

impl std::fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid approval outcome: {}", s)),
        }
    }
}

/// The single, final human resolution for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub call_id: Uuid,
    pub outcome: ApprovalOutcome,
    pub notes: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: String,
}

/// Audit entry for one attempted effect dispatch. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: i64,
    pub call_id: Uuid,
    pub effect: Effect,
    pub external_ref: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub dispatched_at: String,
}

/// A free-text policy document consulted by the Infer/Decide stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDoc {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub created_at: String,
}

// Query surface view types

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallFilters {
    pub status: Option<CallStatus>,
    /// Only calls whose most recently completed stage is this stage.
    pub stage: Option<Stage>,
    /// Inclusive RFC3339 lower bound on created_at.
    pub from: Option<String>,
    /// Inclusive RFC3339 upper bound on created_at.
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDetail {
    pub call: Call,
    /// Full artifact history, superseded rows included, oldest first.
    pub artifacts: Vec<StageArtifact>,
    pub approval: Option<ApprovalRecord>,
    pub actions: Vec<ActionResult>,
}

impl CallDetail {
    /// The live (non-superseded) Decision, if the call has reached one.
    pub fn live_decision(&self) -> Option<&Decision> {
        self.artifacts
            .iter()
            .rev()
            .filter(|a| !a.superseded)
            .find_map(|a| a.payload.as_decision())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub total_calls: i64,
    pub by_status: std::collections::HashMap<String, i64>,
    pub awaiting_approval: i64,
    pub dispatched_effects: i64,
    /// Mean seconds from call creation to the first committed Decision.
    pub avg_time_to_decision_secs: Option<f64>,
}
