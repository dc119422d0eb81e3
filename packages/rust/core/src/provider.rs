//! External AI endpoints: chat completion and balance query.
//!
//! Both are traits so the worker pool and balance monitor can run against
//! scripted fakes. The HTTP implementations speak the OpenAI-compatible chat
//! API and the SiliconFlow user-info endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use intelhub_shared::{
    Credential, IntelHubError, ProviderConfig, ProviderError, RawDocument, Result, SchemaConfig,
};

/// Built-in analysis instructions. `{classifications}`, `{score_min}` and
/// `{score_max}` are filled from the validation config.
pub const DEFAULT_ANALYSIS_PROMPT: &str = r#"You are an intelligence analyst. Read the document that follows and assess its significance.

Reply with a single JSON object and nothing else. Fields:
- "score": number from {score_min} to {score_max}; how significant the document is
- "classification": exactly one of: {classifications}
- "summary": a concise factual summary
- "title": a short headline (optional)
- "times", "locations", "people", "organizations": lists of strings mentioned in the document (optional)
- "impact": likely consequences (optional)
- "tips": what to watch next (optional)

Do not wrap the JSON in Markdown."#;

/// Chat completion capability used by analysis workers.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run one completion. Returns the raw reply text.
    async fn complete(
        &self,
        prompt: &str,
        document_text: &str,
        credential: &Credential,
    ) -> std::result::Result<String, ProviderError>;
}

/// Remaining-budget lookup used by the balance monitor.
#[async_trait]
pub trait BalanceQuery: Send + Sync {
    async fn query_balance(&self, credential: &Credential) -> std::result::Result<f64, ProviderError>;
}

/// Render the analysis prompt for a schema.
pub fn render_prompt(template: &str, schema: &SchemaConfig) -> String {
    template
        .replace("{classifications}", &schema.classifications.join(", "))
        .replace("{score_min}", &schema.score_min.to_string())
        .replace("{score_max}", &schema.score_max.to_string())
}

/// Load the prompt template from `prompt_file`, or fall back to the built-in one.
pub fn load_prompt(config: &ProviderConfig, schema: &SchemaConfig) -> Result<String> {
    let template = match &config.prompt_file {
        Some(file) => {
            let path = intelhub_shared::expand_home(file);
            std::fs::read_to_string(&path).map_err(|e| IntelHubError::io(&path, e))?
        }
        None => DEFAULT_ANALYSIS_PROMPT.to_string(),
    };
    Ok(render_prompt(&template, schema))
}

/// Text sent to the provider: a metadata block followed by the body.
pub fn format_document_text(doc: &RawDocument) -> String {
    let mut text = String::new();
    if let Some(title) = &doc.title {
        text.push_str(&format!("Title: {title}\n"));
    }
    text.push_str(&format!("Source: {}\n", doc.source_name));
    text.push_str(&format!("URL: {}\n", doc.source_url));
    text.push_str(&format!("Crawled: {}\n", doc.crawled_at.to_rfc3339()));
    text.push_str("\n---\n\n");
    text.push_str(&doc.body);
    text
}

// ---------------------------------------------------------------------------
// OpenAI-compatible completion client
// ---------------------------------------------------------------------------

/// Chat completion client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.request_timeout_secs))?,
            endpoint: format!("{}/v1/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleClient {
    async fn complete(
        &self,
        prompt: &str,
        document_text: &str,
        credential: &Credential,
    ) -> std::result::Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt },
                { "role": "user", "content": document_text },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_failure(response).await);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid completion envelope: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Transient("completion has no content".into()))?;

        debug!(model = %self.model, len = content.len(), "completion received");
        Ok(content)
    }
}

// ---------------------------------------------------------------------------
// SiliconFlow balance client
// ---------------------------------------------------------------------------

/// Queries `GET /v1/user/info` and reads `data.totalBalance`.
pub struct SiliconFlowBalanceClient {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    data: Option<UserInfoData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfoData {
    total_balance: Option<serde_json::Value>,
}

impl SiliconFlowBalanceClient {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: config.balance_url.clone(),
        })
    }
}

#[async_trait]
impl BalanceQuery for SiliconFlowBalanceClient {
    async fn query_balance(&self, credential: &Credential) -> std::result::Result<f64, ProviderError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(credential.expose())
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("balance request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid balance response: {e}")))?;

        // totalBalance arrives as a decimal string; accept a number too
        let balance = match info.data.and_then(|d| d.total_balance) {
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        };
        balance
            .filter(|b| b.is_finite())
            .ok_or_else(|| ProviderError::Transient("balance response missing data.totalBalance".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| IntelHubError::Network(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success response onto the provider error taxonomy.
async fn classify_failure(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    classify_status(status, retry_after, &body)
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let snippet: String = body.chars().take(200).collect();
    let detail = format!("HTTP {status}: {snippet}");
    let lowered = body.to_lowercase();
    let mentions_balance = lowered.contains("insufficient") || lowered.contains("quota");

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Auth(detail),
        StatusCode::PAYMENT_REQUIRED => ProviderError::QuotaExceeded(detail),
        StatusCode::FORBIDDEN if mentions_balance => ProviderError::QuotaExceeded(detail),
        StatusCode::FORBIDDEN => ProviderError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        s if s.is_client_error() && mentions_balance => ProviderError::QuotaExceeded(detail),
        _ => ProviderError::Transient(detail),
    }
}
