//! Unified configuration for the switchboard service.
//!
//! Reads `switchboard.toml`, falls back to defaults for anything missing,
//! then applies environment overrides (layered: file → environment → CLI).
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 7180
//! db_path = ".switchboard/calls.db"
//! dev_mode = false
//!
//! [pipeline]
//! persist_debug_artifacts = true
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 500
//! max_delay_ms = 30000
//!
//! [engines]
//! transcribe_url = "http://127.0.0.1:9101/v1/transcribe"
//! transcribe_version = "whisper/3"
//!
//! [effects]
//! email_url = "http://127.0.0.1:9201/v1/email"
//! crm_url = "http://127.0.0.1:9202/v1/crm"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::retry::RetryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub engines: EnginesSection,
    #[serde(default)]
    pub effects: EffectsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Binds 0.0.0.0 and enables permissive CORS.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    7180
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".switchboard/calls.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Whether a debug single-stage run persists its artifact into the call
    /// record (true, the default, keeps calls resumable) or stays ephemeral.
    #[serde(default = "default_true")]
    pub persist_debug_artifacts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            persist_debug_artifacts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesSection {
    #[serde(default = "default_transcribe_url")]
    pub transcribe_url: String,
    #[serde(default = "default_transcribe_version")]
    pub transcribe_version: String,
    #[serde(default = "default_analyze_url")]
    pub analyze_url: String,
    #[serde(default = "default_analyze_version")]
    pub analyze_version: String,
    #[serde(default = "default_infer_url")]
    pub infer_url: String,
    #[serde(default = "default_infer_version")]
    pub infer_version: String,
    #[serde(default = "default_decide_url")]
    pub decide_url: String,
    #[serde(default = "default_decide_version")]
    pub decide_version: String,
}

fn default_transcribe_url() -> String {
    "http://127.0.0.1:9101/v1/transcribe".into()
}

fn default_transcribe_version() -> String {
    "transcribe/1".into()
}

fn default_analyze_url() -> String {
    "http://127.0.0.1:9102/v1/analyze".into()
}

fn default_analyze_version() -> String {
    "analyze/1".into()
}

fn default_infer_url() -> String {
    "http://127.0.0.1:9103/v1/infer".into()
}

fn default_infer_version() -> String {
    "infer/1".into()
}

fn default_decide_url() -> String {
    "http://127.0.0.1:9104/v1/decide".into()
}

fn default_decide_version() -> String {
    "decide/1".into()
}

impl Default for EnginesSection {
    fn default() -> Self {
        Self {
            transcribe_url: default_transcribe_url(),
            transcribe_version: default_transcribe_version(),
            analyze_url: default_analyze_url(),
            analyze_version: default_analyze_version(),
            infer_url: default_infer_url(),
            infer_version: default_infer_version(),
            decide_url: default_decide_url(),
            decide_version: default_decide_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectsSection {
    #[serde(default = "default_email_url")]
    pub email_url: String,
    #[serde(default = "default_crm_url")]
    pub crm_url: String,
}

fn default_email_url() -> String {
    "http://127.0.0.1:9201/v1/email".into()
}

fn default_crm_url() -> String {
    "http://127.0.0.1:9202/v1/crm".into()
}

impl Default for EffectsSection {
    fn default() -> Self {
        Self {
            email_url: default_email_url(),
            crm_url: default_crm_url(),
        }
    }
}

impl SwitchboardConfig {
    /// Load from a toml file, falling back to defaults when the file is
    /// absent, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("SWITCHBOARD_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(db_path) = std::env::var("SWITCHBOARD_DB") {
            self.server.db_path = PathBuf::from(db_path);
        }
        for (var, target) in [
            ("SWITCHBOARD_TRANSCRIBE_URL", &mut self.engines.transcribe_url),
            ("SWITCHBOARD_ANALYZE_URL", &mut self.engines.analyze_url),
            ("SWITCHBOARD_INFER_URL", &mut self.engines.infer_url),
            ("SWITCHBOARD_DECIDE_URL", &mut self.engines.decide_url),
            ("SWITCHBOARD_EMAIL_URL", &mut self.effects.email_url),
            ("SWITCHBOARD_CRM_URL", &mut self.effects.crm_url),
        ] {
            if let Ok(value) = std::env::var(var) {
                *target = value;
            }
        }
    }
}
