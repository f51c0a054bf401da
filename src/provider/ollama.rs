use serde_json::{Map, Value, json};

use crate::request::UserTurn;
use crate::types::{Message, NormalizedEvent};

use super::{ChatProtocol, Framing, Target};

/// Ollama `/api/chat` dialect. Streams newline-delimited JSON objects.
pub struct OllamaProtocol;

impl ChatProtocol for OllamaProtocol {
    fn target(&self) -> Target {
        Target::Ollama
    }

    fn framing(&self) -> Framing {
        Framing::JsonLines
    }

    fn build_body(&self, history: &[Message], turn: &UserTurn, model: &str) -> Value {
        let mut messages: Vec<Value> = history
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect();

        let mut current = Map::new();
        current.insert("role".to_string(), Value::from("user"));
        current.insert("content".to_string(), Value::from(turn.text.as_str()));
        if let Some(image) = &turn.image {
            current.insert("images".to_string(), json!([image.data]));
        }
        messages.push(Value::Object(current));

        json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "temperature": 0.7,
            "top_p": 0.9,
            "top_k": 40,
        })
    }

    fn normalize(&self, payload: &Value) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();
        if let Some(content) = payload.pointer("/message/content").and_then(Value::as_str) {
            events.push(NormalizedEvent::TextDelta(content.to_string()));
        }
        if payload.get("done").and_then(Value::as_bool) == Some(true) {
            events.push(NormalizedEvent::Done);
        }
        if events.is_empty() {
            events.push(NormalizedEvent::Ignorable);
        }
        events
    }

    fn parse_models(&self, body: &Value) -> Vec<String> {
        body.get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|model| model.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
