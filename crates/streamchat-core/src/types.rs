//! Conversation model and wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TurnId;

// =============================================================================
// Conversation Model
// =============================================================================

/// Originating role of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Typed by the user.
    User,
    /// Generated by the backend.
    Assistant,
    /// A turn that failed; content is a short explanation.
    Error,
    /// Placeholder shown before the backend starts answering.
    Thinking,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Error => "error",
            Self::Thinking => "thinking",
        }
    }

    /// Whether turns with this role are part of the history sent to the backend.
    #[must_use]
    pub const fn is_sendable(&self) -> bool {
        matches!(self, Self::User | Self::Assistant)
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique identifier.
    pub id: TurnId,
    /// Who produced it.
    pub role: Role,
    /// Text content. Assistant text is Markdown.
    pub content: String,
    /// When the turn was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Create a turn with a fresh id.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: TurnId::generate(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Greeting placed at the top of a fresh conversation.
pub const SEED_GREETING: &str = "Hello! How can I help you today?";

/// Committed conversation plus the system prompt.
///
/// The in-flight assistant turn is not part of this; see
/// [`crate::pipeline::ChatPipeline::active_turn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Committed turns, oldest first.
    #[serde(rename = "messages")]
    pub turns: Vec<ConversationTurn>,
    /// System prompt sent ahead of the history.
    pub system_prompt: String,
}

impl ConversationState {
    /// A fresh conversation containing only the seed greeting.
    #[must_use]
    pub fn seeded(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![ConversationTurn::assistant(SEED_GREETING)],
            system_prompt: system_prompt.into(),
        }
    }

    /// Index of the turn with the given id.
    #[must_use]
    pub fn position(&self, id: TurnId) -> Option<usize> {
        self.turns.iter().position(|t| t.id == id)
    }

    /// Index of the most recent user turn.
    #[must_use]
    pub fn last_user_position(&self) -> Option<usize> {
        self.turns.iter().rposition(|t| t.role == Role::User)
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// One `{role, content}` entry in a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// Chat request body for the OpenAI-style dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Full history, oldest first.
    pub messages: Vec<WireMessage>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Request body for the single-endpoint dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointRequest {
    /// Liveness probe.
    Health,
    /// Chat turn carrying only the latest user text.
    Chat {
        /// User text.
        message: String,
    },
}

/// Request handed to a transport for one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnRequest {
    /// OpenAI-style body.
    Chat(ChatRequest),
    /// Single-endpoint body.
    Endpoint(EndpointRequest),
}

impl TurnRequest {
    /// Serialize the request body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Chat(req) => serde_json::to_string(req),
            Self::Endpoint(req) => serde_json::to_string(req),
        }
    }
}

/// Body returned by the health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` when the backend is ready.
    #[serde(default)]
    pub status: Option<String>,
}
