// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Chat role for a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures from the LLM seam. Callers treat all of them as "undecided".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// The provider could not be reached or returned a transport error.
    #[error("llm unavailable: {reason}")]
    Unavailable {
        /// Provider-level failure description.
        reason: String,
    },

    /// The response contained no parsable JSON object.
    #[error("llm response contained no JSON object")]
    NoJsonFound,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// The two-method LLM capability the pipeline consumes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a free-form text completion.
    async fn generate_response(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    /// Generate a structured JSON value.
    ///
    /// The default implementation prompts via [`generate_response`]
    /// (prepending `system_prompt` when given) and falls back to
    /// extracting the first balanced JSON object from a prose-wrapped
    /// reply before failing with [`LlmError::NoJsonFound`].
    ///
    /// [`generate_response`]: LlmClient::generate_response
    async fn generate_json(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
    ) -> Result<serde_json::Value, LlmError> {
        let text = match system_prompt {
            Some(sys) => {
                let mut full = Vec::with_capacity(messages.len() + 1);
                full.push(ChatMessage::system(sys));
                full.extend_from_slice(messages);
                self.generate_response(&full).await?
            }
            None => self.generate_response(messages).await?,
        };
        extract_first_json(&text).ok_or(LlmError::NoJsonFound)
    }
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Extract the first balanced JSON object embedded in `text`.
///
/// Brace counting is string- and escape-aware, so braces inside string
/// literals do not unbalance the scan. Returns `None` when no balanced
/// object parses as JSON.
///
/// # Examples
///
/// ```
/// use saga_llm::extract_first_json;
///
/// let v = extract_first_json("Sure! {\"command\": \"roll\"} Hope that helps.").unwrap();
/// assert_eq!(v["command"], "roll");
/// ```
#[must_use]
pub fn extract_first_json(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if start.is_none() {
            if b == b'{' {
                start = Some(i);
                depth = 1;
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start.unwrap_or(0)..=i];
                    if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate)
                        && v.is_object()
                    {
                        return Some(v);
                    }
                    // Malformed candidate; resume scanning after it.
                    start = None;
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Scripted test double
// ---------------------------------------------------------------------------

/// An [`LlmClient`] that replays a fixed script of responses.
///
/// Each call to [`LlmClient::generate_response`] pops the next scripted
/// reply and records the prompt for later assertions. An exhausted script
/// reports [`LlmError::Unavailable`].
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    /// Create a double that replies with `responses` in order.
    #[must_use]
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of generate calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate_response(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| LlmError::Unavailable {
                reason: "script exhausted".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
