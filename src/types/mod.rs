//! Shared data structures for conversations, generation state and session events.
//!
//! These types are target-agnostic; each provider dialect translates them into its own
//! wire format in [`crate::provider`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::image::{DEFAULT_IMAGE_MEDIA_TYPE, ImageEncoder};

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name shared by every supported target.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Image attached to a user turn, already base64-encoded by an [`ImageEncoder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedImage {
    /// Base64 payload without any `data:` prefix.
    pub data: String,
    /// MIME type announced to providers that need one.
    pub media_type: String,
}

impl AttachedImage {
    /// Wraps an already-encoded JPEG payload.
    pub fn from_base64(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            media_type: DEFAULT_IMAGE_MEDIA_TYPE.to_string(),
        }
    }

    /// Encodes raw image bytes through the given collaborator.
    ///
    /// # Examples
    ///
    /// ```
    /// use chat_bridge::image::Base64ImageEncoder;
    /// use chat_bridge::types::AttachedImage;
    ///
    /// let image = AttachedImage::encode(b"abc", &Base64ImageEncoder);
    /// assert_eq!(image.data, "YWJj");
    /// assert_eq!(image.media_type, "image/jpeg");
    /// ```
    pub fn encode(bytes: &[u8], encoder: &dyn ImageEncoder) -> Self {
        Self {
            data: encoder.encode(bytes),
            media_type: encoder.media_type().to_string(),
        }
    }

    /// Renders the image as a `data:` URL, as OpenAI expects.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// One entry of the conversation history.
///
/// Identity and role are fixed at creation. Content only grows while the owning
/// generation streams and is frozen once the message is appended to the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub attached_image: Option<AttachedImage>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a user message with a fresh identifier.
    pub fn user(content: impl Into<String>, attached_image: Option<AttachedImage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            attached_image,
            created_at: Utc::now(),
        }
    }

    /// Creates an assistant message with a fresh identifier.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content: content.into(),
            attached_image: None,
            created_at: Utc::now(),
        }
    }
}

/// Result of normalizing one decoded provider frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// Incremental assistant text to append to the in-progress response.
    TextDelta(String),
    /// The provider's own end-of-turn signal.
    Done,
    /// Frame carried nothing relevant to the text stream.
    Ignorable,
}

/// Lifecycle position of a session's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    #[default]
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// Snapshot of the generation bookkeeping held by a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationState {
    pub is_active: bool,
    pub accumulated_text: String,
    /// Display form of the last failure, cleared by a new generation or `clear`.
    pub last_error: Option<String>,
}

/// Notifications published on a session's event channel.
///
/// UI layers subscribe to these instead of polling observable properties.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A generation moved to streaming; the user message is already in the history.
    GenerationStarted { generation: u64 },
    /// The accumulated text after applying a delta.
    Partial { generation: u64, accumulated: String },
    /// A message was appended to the history.
    MessageAppended(Message),
    /// A generation reached a terminal phase.
    GenerationSettled {
        generation: u64,
        phase: GenerationPhase,
    },
    /// The history was discarded.
    Cleared,
}
