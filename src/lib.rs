//! Streaming chat bridge over Ollama, LM Studio, Anthropic Claude and OpenAI.
//!
//! A [`Session`] builds provider-correct requests from a uniform conversation history,
//! decodes the provider's SSE or JSON-lines stream, normalizes every frame into text
//! deltas and keeps at most one generation in flight.

pub mod config;
pub mod error;
pub mod generation;
pub mod http;
pub mod image;
pub mod models;
pub mod provider;
pub mod request;
pub mod session;
pub mod stream;
pub mod types;

pub use config::SessionConfig;
pub use error::BridgeError;
pub use generation::{GenerationHandle, GenerationOutcome, TextStream};
pub use provider::{ProviderProfile, Target};
pub use session::Session;
pub use types::*;
