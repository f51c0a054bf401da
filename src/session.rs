use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::BridgeError;
use crate::generation::{GenerationHandle, GenerationOutcome, GenerationTask, Shared, TextStream};
use crate::http::DynHttpTransport;
use crate::http::reqwest::default_dyn_transport;
use crate::models::{ModelQuery, list_models};
use crate::provider::{DynProtocol, ProviderProfile, Target, profile_for, protocol_for};
use crate::request::{ChatRequestParts, UserTurn, build_chat_request};
use crate::types::{AttachedImage, GenerationPhase, GenerationState, Message, SessionEvent};

const EVENT_CAPACITY: usize = 256;

/// A long-lived connection to one target, owning the conversation history.
///
/// Configuration is fixed at construction; build a new session to change target,
/// endpoint or key. At most one generation streams at a time: starting another cancels
/// the running one and waits for it to settle first.
///
/// Cloning is cheap and every clone drives the same history.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    profile: ProviderProfile,
    protocol: DynProtocol,
    transport: DynHttpTransport,
    shared: Arc<Shared>,
    running: AsyncMutex<Option<JoinHandle<()>>>,
    next_generation: AtomicU64,
}

impl Session {
    /// Builds a session over the given transport.
    ///
    /// Missing credentials are not reported here; they fail the first request instead.
    pub fn new(config: SessionConfig, transport: DynHttpTransport) -> Self {
        let profile = profile_for(config.target, &config.host, config.port);
        let protocol = protocol_for(config.target);
        tracing::debug!(provider = %config.target, base_url = %profile.base_url, "session created");
        Self {
            inner: Arc::new(SessionInner {
                config,
                profile,
                protocol,
                transport,
                shared: Arc::new(Shared::new(EVENT_CAPACITY)),
                running: AsyncMutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Builds a session over the default reqwest transport.
    ///
    /// # Examples
    ///
    /// ```
    /// use chat_bridge::{Session, Target};
    ///
    /// let session = Session::construct("http://localhost", 11434, Target::Ollama, None).unwrap();
    /// assert_eq!(session.profile().chat_url(), "http://localhost:11434/api/chat");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the HTTP client cannot be created.
    pub fn construct(
        host: &str,
        port: u16,
        target: Target,
        api_key: Option<String>,
    ) -> Result<Self, BridgeError> {
        let mut config = SessionConfig::new(target)
            .with_host(host)
            .with_port(port);
        config.api_key = api_key;
        Ok(Self::new(config, default_dyn_transport()?))
    }

    pub fn target(&self) -> Target {
        self.inner.config.target
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.inner.profile
    }

    /// Snapshot of the conversation, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.inner.shared.state.lock().history.clone()
    }

    pub fn generation_state(&self) -> GenerationState {
        self.inner.shared.state.lock().generation.clone()
    }

    /// `Streaming` while a generation runs, otherwise `Idle`.
    pub fn phase(&self) -> GenerationPhase {
        self.inner.shared.state.lock().phase()
    }

    /// Subscribes to history and generation events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Lists the models the target offers. Never touches the history.
    ///
    /// # Errors
    ///
    /// See [`crate::models::list_models`].
    pub async fn list_models(&self) -> Result<Vec<String>, BridgeError> {
        let inner = &self.inner;
        list_models(ModelQuery {
            transport: inner.transport.as_ref(),
            profile: &inner.profile,
            protocol: inner.protocol.as_ref(),
            api_key: inner.config.api_key.as_deref(),
            strict: inner.config.strict_model_listing,
        })
        .await
    }

    /// Sends a user turn and awaits the assistant reply.
    ///
    /// An empty reply resolves to the unrecorded "Failed to generate response." message.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Cancelled`] if the generation was cancelled (any partial text is
    /// already in the history), otherwise the error that failed the generation.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        image: Option<AttachedImage>,
        model: Option<&str>,
    ) -> Result<Message, BridgeError> {
        let handle = self.start_generation(text, image, model).await?;
        match handle.wait().await? {
            GenerationOutcome::Completed(message) | GenerationOutcome::Empty(message) => {
                Ok(message)
            }
            GenerationOutcome::Cancelled { .. } => Err(BridgeError::Cancelled),
        }
    }

    /// Sends a user turn and returns its text deltas as a stream.
    ///
    /// # Errors
    ///
    /// Fails like [`Session::start_generation`].
    pub async fn stream_message(
        &self,
        text: impl Into<String>,
        image: Option<AttachedImage>,
        model: Option<&str>,
    ) -> Result<TextStream, BridgeError> {
        Ok(self
            .start_generation(text, image, model)
            .await?
            .into_text_stream())
    }

    /// Starts a generation on its own task and returns a handle to it.
    ///
    /// Any running generation is cancelled and settled first. The user message is in the
    /// history when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MissingCredential`] for a cloud target without a key, before
    /// the history is touched.
    pub async fn start_generation(
        &self,
        text: impl Into<String>,
        image: Option<AttachedImage>,
        model: Option<&str>,
    ) -> Result<GenerationHandle, BridgeError> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if let Some(previous) = running.take() {
            settle(inner, previous).await;
        }

        let turn = UserTurn {
            text: text.into(),
            image,
        };
        let model = model
            .map(str::to_string)
            .or_else(|| inner.config.model.clone())
            .unwrap_or_else(|| inner.profile.default_model.to_string());
        let id = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let (request, events) = {
            let mut state = inner.shared.state.lock();
            let request = build_chat_request(ChatRequestParts {
                profile: &inner.profile,
                protocol: inner.protocol.as_ref(),
                api_key: inner.config.api_key.as_deref(),
                history: &state.history,
                turn: &turn,
                model: &model,
                timeout: inner.config.request_timeout,
            })?;
            let user = Message::user(turn.text, turn.image);
            (request, state.begin(id, user, cancel.clone()))
        };
        inner.shared.publish(events);
        tracing::debug!(generation = id, %model, "generation started");

        let (deltas_tx, deltas_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = GenerationTask {
            id,
            shared: inner.shared.clone(),
            transport: inner.transport.clone(),
            protocol: inner.protocol.clone(),
            request,
            cancel: cancel.clone(),
            deltas: deltas_tx,
        };
        *running = Some(tokio::spawn(async move {
            let result = task.run().await;
            let _ = outcome_tx.send(result);
        }));

        Ok(GenerationHandle::new(id, cancel, outcome_rx, deltas_rx))
    }

    /// Cancels the running generation, if any, and waits until it has settled.
    ///
    /// Returns `true` when a generation was running.
    pub async fn cancel_generation(&self) -> bool {
        let mut running = self.inner.running.lock().await;
        let was_streaming = self.phase() == GenerationPhase::Streaming;
        if let Some(task) = running.take() {
            settle(&self.inner, task).await;
        }
        was_streaming
    }

    /// Discards the history and the last error.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::GenerationActive`] while a generation is streaming; cancel
    /// it first.
    pub fn clear_messages(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.inner.shared.state.lock();
            if state.generation.is_active {
                return Err(BridgeError::GenerationActive);
            }
            state.history.clear();
            state.generation = GenerationState::default();
        }
        self.inner.shared.publish(vec![SessionEvent::Cleared]);
        Ok(())
    }
}

/// Cancels whatever is streaming and waits for `task` to finish.
async fn settle(inner: &SessionInner, task: JoinHandle<()>) {
    let cancel = inner.shared.state.lock().active_cancel();
    if let Some(cancel) = cancel {
        cancel.cancel();
    }
    if let Err(err) = task.await {
        tracing::warn!(error = %err, "generation task did not complete cleanly");
    }
}
