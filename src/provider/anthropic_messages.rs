use serde_json::{Value, json};

use crate::request::UserTurn;
use crate::types::{Message, NormalizedEvent};

use super::openai_chat::data_ids;
use super::{ChatProtocol, Framing, Target};

/// Anthropic Messages dialect (Claude 3.x).
pub struct AnthropicMessagesProtocol;

impl AnthropicMessagesProtocol {
    fn current_content(turn: &UserTurn) -> Value {
        let mut blocks = Vec::with_capacity(2);
        // image block precedes the text block
        if let Some(image) = &turn.image {
            blocks.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.media_type,
                    "data": image.data,
                },
            }));
        }
        blocks.push(json!({ "type": "text", "text": turn.text }));
        Value::Array(blocks)
    }
}

impl ChatProtocol for AnthropicMessagesProtocol {
    fn target(&self) -> Target {
        Target::Claude
    }

    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn build_body(&self, history: &[Message], turn: &UserTurn, model: &str) -> Value {
        let mut messages: Vec<Value> = history
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect();
        messages.push(json!({ "role": "user", "content": Self::current_content(turn) }));

        json!({
            "model": model,
            "messages": messages,
            "max_tokens": 4096,
            "stream": true,
            "temperature": 0.7,
        })
    }

    fn normalize(&self, payload: &Value) -> Vec<NormalizedEvent> {
        let event = match payload.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => payload
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .map(|text| NormalizedEvent::TextDelta(text.to_string()))
                .unwrap_or(NormalizedEvent::Ignorable),
            Some("message_stop") => NormalizedEvent::Done,
            _ => NormalizedEvent::Ignorable,
        };
        vec![event]
    }

    fn parse_models(&self, body: &Value) -> Vec<String> {
        data_ids(body)
    }
}
