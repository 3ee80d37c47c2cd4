use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

use crate::models::job::AnalysisMode;
use crate::services::prompts;

/// Inputs of one analysis call.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisRequest<'a> {
    pub note: &'a str,
    pub specialty: &'a str,
    /// PNG data URIs.
    pub images: &'a [String],
    pub image_notes: &'a [String],
    pub mode: AnalysisMode,
    pub prompt_modifier: Option<&'a str>,
}

/// Output of one analysis call.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub text: String,
    pub detected_conditions: Vec<String>,
}

/// The LLM collaborator used by the worker and the synchronous endpoint.
///
/// Any error is a job failure; callers do not retry.
pub trait AnalysisEngine: Send + Sync + 'static {
    fn analyze(
        &self,
        request: AnalysisRequest<'_>,
    ) -> impl Future<Output = Result<AnalysisReport, AnalysisError>> + Send;
}

/// Settings for [`OpenAiClient`].
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    pub fast_model: String,
    pub full_model: String,
    pub full_max_tokens: u32,
    pub fast_timeout: Duration,
    pub full_timeout: Duration,
}

/// Client for an OpenAI-compatible chat completions API.
///
/// Fast and full passes use separate HTTP clients so each has its own
/// deadline: the fast pass must fail quickly, the full pass may take minutes.
pub struct OpenAiClient {
    fast_http: Client,
    full_http: Client,
    settings: OpenAiSettings,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(settings: OpenAiSettings) -> Result<Self, AnalysisError> {
        let fast_http = Client::builder()
            .connect_timeout(Duration::from_secs(5).min(settings.fast_timeout))
            .timeout(settings.fast_timeout)
            .build()?;
        let full_http = Client::builder()
            .connect_timeout(Duration::from_secs(20).min(settings.full_timeout))
            .timeout(settings.full_timeout)
            .build()?;

        Ok(Self {
            fast_http,
            full_http,
            settings,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    /// Short JSON triage.
    async fn fast_analysis(&self, request: &AnalysisRequest<'_>) -> Result<String, AnalysisError> {
        let body = serde_json::json!({
            "model": self.settings.fast_model,
            "messages": [
                { "role": "system", "content": prompts::system_prompt(AnalysisMode::Fast) },
                { "role": "user", "content": prompts::build_fast_prompt(request.note) }
            ],
            "temperature": 0.2,
            "max_tokens": 400,
            "response_format": { "type": "json_object" }
        });

        self.complete(&self.fast_http, &body).await
    }

    /// Ten-section report with images attached.
    async fn full_analysis(
        &self,
        request: &AnalysisRequest<'_>,
        detected_conditions: &[String],
    ) -> Result<String, AnalysisError> {
        let prompt = prompts::build_full_prompt(
            request.note,
            request.prompt_modifier,
            detected_conditions,
            request.image_notes,
        );

        let mut content = vec![serde_json::json!({ "type": "text", "text": prompt })];
        content.extend(request.images.iter().map(|uri| {
            serde_json::json!({ "type": "image_url", "image_url": { "url": uri } })
        }));

        let body = serde_json::json!({
            "model": self.settings.full_model,
            "messages": [
                { "role": "system", "content": prompts::system_prompt(AnalysisMode::Full) },
                { "role": "user", "content": content }
            ],
            "temperature": 0.2,
            "max_tokens": self.settings.full_max_tokens
        });

        self.complete(&self.full_http, &body).await
    }

    async fn complete(
        &self,
        http: &Client,
        body: &serde_json::Value,
    ) -> Result<String, AnalysisError> {
        let response = http
            .post(self.completions_url())
            .bearer_auth(&self.settings.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        extract_content(completion)
    }
}

impl AnalysisEngine for OpenAiClient {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisReport, AnalysisError> {
        let detected_conditions = prompts::detect_conditions(request.note);
        let text = match request.mode {
            AnalysisMode::Fast => self.fast_analysis(&request).await?,
            AnalysisMode::Full => self.full_analysis(&request, &detected_conditions).await?,
        };

        Ok(AnalysisReport {
            text,
            detected_conditions,
        })
    }
}

fn extract_content(completion: ChatCompletionResponse) -> Result<String, AnalysisError> {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or(AnalysisError::EmptyResponse)
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("LLM API returned an empty completion")]
    EmptyResponse,
}
