//! Scripted model backend for tests.
//!
//! Returns predetermined responses and records every request so tests can
//! assert on call counts and on the conversation the model was shown.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, ToolCall, ToolDefinition};

/// A single scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// Plain assistant text.
    Text(String),
    /// Assistant turn requesting tool calls.
    Tools(Vec<ToolCall>),
    /// Request failure.
    Error(String),
}

/// One recorded request.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    replies: Vec<MockReply>,
    repeat_last: bool,
    requests: Vec<RecordedRequest>,
}

/// Mock model client.
///
/// Replies are consumed in order. Once exhausted, the last reply repeats when
/// built with [`MockLlm::repeating`], otherwise requests fail.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockLlm {
    inner: Arc<Mutex<Inner>>,
}

impl MockLlm {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                replies,
                ..Default::default()
            })),
        }
    }

    /// Like [`MockLlm::new`] but the final reply is returned forever.
    pub fn repeating(replies: Vec<MockReply>) -> Self {
        let mock = Self::new(replies);
        mock.inner.lock().unwrap().repeat_last = true;
        mock
    }

    /// A client that always answers with `text`.
    pub fn always(text: &str) -> Self {
        Self::repeating(vec![MockReply::Text(text.to_string())])
    }

    /// Number of requests received.
    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        _options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.requests.len();
        inner.requests.push(RecordedRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tool_names: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.function.name.clone())
                .collect(),
        });

        let reply = match inner.replies.get(index) {
            Some(reply) => reply.clone(),
            None if inner.repeat_last && !inner.replies.is_empty() => {
                inner.replies[inner.replies.len() - 1].clone()
            }
            None => anyhow::bail!("mock model has no reply for request {}", index + 1),
        };

        match reply {
            MockReply::Text(text) => Ok(ChatResponse {
                content: Some(text),
                finish_reason: Some("stop".to_string()),
                ..Default::default()
            }),
            MockReply::Tools(calls) => Ok(ChatResponse {
                tool_calls: Some(calls),
                finish_reason: Some("tool_calls".to_string()),
                ..Default::default()
            }),
            MockReply::Error(message) => anyhow::bail!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ask(mock: &MockLlm) -> Result<ChatResponse> {
        mock.chat_completion("m", &[ChatMessage::user("hi")], None, &ChatOptions::default())
            .await
    }

    #[tokio::test]
    async fn test_replies_in_order_then_fail() {
        let mock = MockLlm::new(vec![
            MockReply::Text("first".to_string()),
            MockReply::Text("second".to_string()),
        ]);

        assert_eq!(ask(&mock).await.unwrap().content.as_deref(), Some("first"));
        assert_eq!(ask(&mock).await.unwrap().content.as_deref(), Some("second"));
        assert!(ask(&mock).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_repeating_returns_last_reply() {
        let mock = MockLlm::always("again");
        for _ in 0..3 {
            assert_eq!(ask(&mock).await.unwrap().content.as_deref(), Some("again"));
        }
    }

    #[tokio::test]
    async fn test_error_reply() {
        let mock = MockLlm::new(vec![MockReply::Error("rate limit exceeded".to_string())]);
        let err = ask(&mock).await.unwrap_err();
        assert!(err.to_string().contains("rate limit"));
    }

    #[tokio::test]
    async fn test_records_requests() {
        let mock = MockLlm::always("ok");
        let _ = ask(&mock).await;
        let requests = mock.requests();
        assert_eq!(requests[0].model, "m");
        assert_eq!(requests[0].messages[0].text(), Some("hi"));
        assert!(requests[0].tool_names.is_empty());
    }
}
