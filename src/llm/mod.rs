//! Chat-completion backends used by the generate step.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

mod ollama;
mod openai;

pub use ollama::OllamaChat;
pub use openai::OpenAiChat;

/// Default sampling temperature for answers.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions prepended by the workflow.
    System,
    /// End user.
    User,
    /// Model reply.
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message author.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Trait implemented by concrete LLM providers.
pub trait ChatModel {
    /// Returns the assistant reply for the given conversation.
    fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

impl<M: ChatModel + ?Sized> ChatModel for &M {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        (**self).complete(messages)
    }
}

impl<M: ChatModel + ?Sized> ChatModel for Box<M> {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        (**self).complete(messages)
    }
}

impl<M: ChatModel + ?Sized> ChatModel for Arc<M> {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        (**self).complete(messages)
    }
}
