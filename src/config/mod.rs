use serde::Deserialize;
use std::time::Duration;

use crate::services::analysis::OpenAiSettings;
use crate::services::worker::WorkerConfig;

// Slack on top of the LLM deadlines for the result write.
const LEASE_MARGIN_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:5000"). Ignored by the worker binary.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Key for the OpenAI-compatible chat completions API
    pub openai_api_key: String,

    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    /// Model used for the fast triage pass
    #[serde(default = "default_fast_model")]
    pub fast_model: String,

    /// Model used for the full ten-section report
    #[serde(default = "default_full_model")]
    pub full_model: String,

    #[serde(default = "default_full_max_tokens")]
    pub full_max_tokens: u32,

    #[serde(default = "default_fast_timeout_secs")]
    pub fast_timeout_secs: u64,

    #[serde(default = "default_full_timeout_secs")]
    pub full_timeout_secs: u64,

    /// Maximum images considered per submission
    #[serde(default = "default_max_analyze_images")]
    pub max_analyze_images: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Run claim loops inside the API server process
    #[serde(default = "default_embedded_worker")]
    pub embedded_worker: bool,

    /// Claim loops per process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Reclaim `processing` rows idle for this long. Unset: never reclaim.
    /// Raised to outlast the LLM deadlines, see [`AppConfig::processing_lease`].
    #[serde(default)]
    pub processing_lease_secs: Option<u64>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_fast_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_full_model() -> String {
    "gpt-5".to_string()
}

fn default_full_max_tokens() -> u32 {
    3000
}

fn default_fast_timeout_secs() -> u64 {
    20
}

fn default_full_timeout_secs() -> u64 {
    240
}

fn default_max_analyze_images() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_error_backoff_ms() -> u64 {
    2000
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_embedded_worker() -> bool {
    true
}

fn default_worker_concurrency() -> usize {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn openai_settings(&self) -> OpenAiSettings {
        OpenAiSettings {
            api_key: self.openai_api_key.clone(),
            base_url: self.openai_base_url.clone(),
            fast_model: self.fast_model.clone(),
            full_model: self.full_model.clone(),
            full_max_tokens: self.full_max_tokens,
            fast_timeout: Duration::from_secs(self.fast_timeout_secs),
            full_timeout: Duration::from_secs(self.full_timeout_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        }
    }

    /// Zero is treated as unset. A live job is never reclaimed: leases that
    /// do not outlast both LLM deadlines are raised to that floor.
    pub fn processing_lease(&self) -> Option<Duration> {
        let requested = self.processing_lease_secs.filter(|secs| *secs > 0)?;
        let floor = self.fast_timeout_secs + self.full_timeout_secs + LEASE_MARGIN_SECS;
        if requested < floor {
            tracing::warn!(
                requested_secs = requested,
                lease_secs = floor,
                "PROCESSING_LEASE_SECS shorter than the LLM deadlines, raising it"
            );
            return Some(Duration::from_secs(floor));
        }
        Some(Duration::from_secs(requested))
    }
}
