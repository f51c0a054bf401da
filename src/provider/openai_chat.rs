use serde_json::{Value, json};

use crate::request::UserTurn;
use crate::types::{Message, NormalizedEvent};

use super::{ChatProtocol, Framing, Target};

/// Chat Completions dialect shared by OpenAI and LM Studio.
///
/// The two differ only in whether the current turn may carry an image.
pub struct OpenAiChatProtocol {
    target: Target,
}

impl OpenAiChatProtocol {
    pub fn openai() -> Self {
        Self {
            target: Target::OpenAi,
        }
    }

    pub fn lm_studio() -> Self {
        Self {
            target: Target::LmStudio,
        }
    }

    fn current_content(&self, turn: &UserTurn) -> Value {
        match (&turn.image, self.target) {
            (Some(image), Target::OpenAi) => json!([
                {"type": "text", "text": turn.text},
                {"type": "image_url", "image_url": {"url": image.data_url()}},
            ]),
            (Some(_), _) => {
                tracing::warn!(
                    provider = %self.target,
                    "image attachments are not supported for this target, sending text only"
                );
                Value::from(turn.text.as_str())
            }
            (None, _) => Value::from(turn.text.as_str()),
        }
    }
}

impl ChatProtocol for OpenAiChatProtocol {
    fn target(&self) -> Target {
        self.target
    }

    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn build_body(&self, history: &[Message], turn: &UserTurn, model: &str) -> Value {
        let mut messages: Vec<Value> = history
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect();
        messages.push(json!({ "role": "user", "content": self.current_content(turn) }));

        json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "temperature": 0.7,
            "max_tokens": 2048,
        })
    }

    fn normalize(&self, payload: &Value) -> Vec<NormalizedEvent> {
        let Some(choice) = payload.pointer("/choices/0") else {
            return vec![NormalizedEvent::Ignorable];
        };
        let mut events = Vec::new();
        if let Some(content) = choice.pointer("/delta/content").and_then(Value::as_str) {
            events.push(NormalizedEvent::TextDelta(content.to_string()));
        }
        if choice.get("finish_reason").and_then(Value::as_str) == Some("stop") {
            events.push(NormalizedEvent::Done);
        }
        if events.is_empty() {
            events.push(NormalizedEvent::Ignorable);
        }
        events
    }

    fn parse_models(&self, body: &Value) -> Vec<String> {
        data_ids(body)
    }
}

/// Collects `data[].id`, the listing shape of OpenAI-style and Anthropic model endpoints.
pub(crate) fn data_ids(body: &Value) -> Vec<String> {
    body.get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|model| model.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
