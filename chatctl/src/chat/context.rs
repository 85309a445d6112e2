//! Request and response types flowing through the chat pipeline.

use serde::{Deserialize, Serialize};

use crate::types::{GroupId, UserId};

/// The authenticated caller, as far as the pipeline needs to know it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: UserId,
    /// Ordered; the first entry decides the quota
    pub user_group_ids: Vec<GroupId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name; also the ledger key usage is recorded under
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Everything a stage can see about one in-flight request.
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub user: ChatUser,
    pub request: ChatRequest,
}

impl ChatContext {
    pub fn new(user: ChatUser, request: ChatRequest) -> Self {
        Self { user, request }
    }
}

/// Token consumption reported by the model provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    /// `None` when the provider did not report usage
    pub usage: Option<TokenUsage>,
}
