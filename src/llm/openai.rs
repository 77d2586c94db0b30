//! OpenAI-compatible chat completions client with retry for transient errors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, TokenUsage, ToolCall,
    ToolDefinition,
};
use crate::config::ModelConfig;

/// Client for `POST {api_base}/chat/completions`.
pub(crate) struct OpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiClient {
    /// Builds a client from configuration, reading the API key from the environment.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
        })
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.map_err(|e| LlmError::Network {
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body, retry_after));
        }

        parse_response(&body)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let request = ChatRequest {
            model,
            messages,
            tools,
            tool_choice: tools.map(|_| "auto"),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        debug!(
            "Sending chat completion: model={} messages={} tools={}",
            model,
            messages.len(),
            tools.map_or(0, <[ToolDefinition]>::len)
        );

        let mut attempt = 0;
        loop {
            match self.execute_request(&request).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    let delay = error.retry_delay(attempt);
                    warn!(
                        "Model request attempt {} failed, retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// Request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Parses a successful response body.
fn parse_response(body: &str) -> Result<ChatResponse, LlmError> {
    let parsed: ChatCompletion = serde_json::from_str(body).map_err(|e| LlmError::Parse {
        message: format!("{e}, body: {}", body.get(..500).unwrap_or(body)),
    })?;

    let choice = parsed.choices.into_iter().next().ok_or_else(|| LlmError::Parse {
        message: "No choices in response".to_string(),
    })?;

    Ok(ChatResponse {
        content: choice.message.content,
        tool_calls: choice.message.tool_calls.filter(|calls| !calls.is_empty()),
        finish_reason: choice.finish_reason,
        usage: parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}
