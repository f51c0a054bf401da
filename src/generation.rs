//! The generation state machine: `Idle -> Streaming -> {Completed | Cancelled | Failed}`.
//!
//! A generation runs on its own tokio task so the caller can await it and cancel it
//! independently. Frames are consumed strictly in arrival order; every delta is applied
//! to the accumulation buffer under the session lock before the next frame is read.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::http::{DynHttpTransport, HttpRequest};
use crate::provider::DynProtocol;
use crate::provider::error::server_error;
use crate::stream::FrameDecoder;
use crate::types::{
    GenerationPhase, GenerationState, Message, NormalizedEvent, SessionEvent,
};

/// Returned, but not recorded, when a generation finishes without any text.
pub const FAILED_RESPONSE: &str = "Failed to generate response.";
/// Appended to partial text kept after a cancellation.
pub const CANCELLED_NOTE: &str = "Cancelled by user.";

/// How a settled generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// The assistant message now at the end of the history.
    Completed(Message),
    /// The stream ended without text; the sentinel message was not recorded.
    Empty(Message),
    /// Stopped by the caller. `partial` is the annotated message recorded, if any.
    Cancelled { partial: Option<Message> },
}

impl GenerationOutcome {
    pub fn message(&self) -> Option<&Message> {
        match self {
            GenerationOutcome::Completed(message) | GenerationOutcome::Empty(message) => {
                Some(message)
            }
            GenerationOutcome::Cancelled { partial } => partial.as_ref(),
        }
    }

    pub fn phase(&self) -> GenerationPhase {
        match self {
            GenerationOutcome::Completed(_) | GenerationOutcome::Empty(_) => {
                GenerationPhase::Completed
            }
            GenerationOutcome::Cancelled { .. } => GenerationPhase::Cancelled,
        }
    }
}

/// Why the frame loop stopped.
#[derive(Debug)]
pub(crate) enum Termination {
    /// End-of-turn signal, `[DONE]` or the server closing the stream.
    Finished,
    Cancelled,
    Failed(BridgeError),
}

struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
}

/// History plus generation bookkeeping, owned by one session.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) history: Vec<Message>,
    pub(crate) generation: GenerationState,
    phase: GenerationPhase,
    active: Option<ActiveGeneration>,
}

impl SessionState {
    pub(crate) fn phase(&self) -> GenerationPhase {
        self.phase
    }

    pub(crate) fn active_cancel(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|active| active.cancel.clone())
    }

    /// Records the user turn and enters `Streaming`.
    pub(crate) fn begin(
        &mut self,
        id: u64,
        user: Message,
        cancel: CancellationToken,
    ) -> Vec<SessionEvent> {
        self.history.push(user.clone());
        self.generation = GenerationState {
            is_active: true,
            accumulated_text: String::new(),
            last_error: None,
        };
        self.phase = GenerationPhase::Streaming;
        self.active = Some(ActiveGeneration { id, cancel });
        vec![
            SessionEvent::MessageAppended(user),
            SessionEvent::GenerationStarted { generation: id },
        ]
    }

    /// Appends a delta; `false` for a stale id.
    pub(crate) fn apply_delta(&mut self, id: u64, text: &str) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.generation.accumulated_text.push_str(text);
        true
    }

    /// Settles generation `id` and returns its result plus the events to publish.
    pub(crate) fn finish(
        &mut self,
        id: u64,
        termination: Termination,
    ) -> (Result<GenerationOutcome, BridgeError>, Vec<SessionEvent>) {
        if !self.is_current(id) {
            return (Err(BridgeError::Cancelled), Vec::new());
        }
        let partial = self.generation.accumulated_text.clone();
        let mut events = Vec::new();

        let (phase, result) = match termination {
            Termination::Finished if partial.is_empty() => (
                GenerationPhase::Completed,
                Ok(GenerationOutcome::Empty(Message::assistant(FAILED_RESPONSE))),
            ),
            Termination::Finished => {
                let message = self.record(Message::assistant(partial), &mut events);
                (
                    GenerationPhase::Completed,
                    Ok(GenerationOutcome::Completed(message)),
                )
            }
            Termination::Cancelled => {
                let partial = (!partial.is_empty()).then(|| {
                    self.record(
                        Message::assistant(format!("{partial}\n{CANCELLED_NOTE}")),
                        &mut events,
                    )
                });
                (
                    GenerationPhase::Cancelled,
                    Ok(GenerationOutcome::Cancelled { partial }),
                )
            }
            Termination::Failed(err) => {
                if !partial.is_empty() {
                    self.record(
                        Message::assistant(format!("{partial}\nError: {err}")),
                        &mut events,
                    );
                }
                self.generation.last_error = Some(err.to_string());
                (GenerationPhase::Failed, Err(err))
            }
        };

        self.generation.is_active = false;
        self.active = None;
        self.phase = GenerationPhase::Idle;
        events.push(SessionEvent::GenerationSettled {
            generation: id,
            phase,
        });
        (result, events)
    }

    fn is_current(&self, id: u64) -> bool {
        self.active.as_ref().is_some_and(|active| active.id == id)
    }

    fn record(&mut self, message: Message, events: &mut Vec<SessionEvent>) -> Message {
        self.history.push(message.clone());
        events.push(SessionEvent::MessageAppended(message.clone()));
        message
    }
}

/// State and event channel shared between a session and its generation tasks.
pub(crate) struct Shared {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(SessionState::default()),
            events,
        }
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        self.events.receiver_count() > 0
    }

    pub(crate) fn publish(&self, events: Vec<SessionEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

/// Everything a generation task needs; moved onto the task.
pub(crate) struct GenerationTask {
    pub(crate) id: u64,
    pub(crate) shared: Arc<Shared>,
    pub(crate) transport: DynHttpTransport,
    pub(crate) protocol: DynProtocol,
    pub(crate) request: HttpRequest,
    pub(crate) cancel: CancellationToken,
    pub(crate) deltas: mpsc::UnboundedSender<String>,
}

impl GenerationTask {
    /// Drives the stream to a terminal state and settles the session.
    pub(crate) async fn run(self) -> Result<GenerationOutcome, BridgeError> {
        let termination = self.drive().await;
        tracing::debug!(generation = self.id, ?termination, "generation stream stopped");
        let (result, events) = self.shared.state.lock().finish(self.id, termination);
        match &result {
            Ok(outcome) => {
                tracing::info!(generation = self.id, phase = ?outcome.phase(), "generation settled")
            }
            Err(err) => tracing::info!(
                generation = self.id,
                error = %err,
                before_stream = err.is_pre_stream(),
                "generation failed"
            ),
        }
        self.shared.publish(events);
        result
    }

    async fn drive(&self) -> Termination {
        tracing::debug!(
            generation = self.id,
            provider = %self.protocol.target(),
            url = %self.request.url,
            "opening chat stream"
        );
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Termination::Cancelled,
            response = self.transport.send_stream(self.request.clone()) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => return Termination::Failed(err),
        };
        if response.status != 200 {
            let status = response.status;
            let body = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Termination::Cancelled,
                body = response.drain_text() => body,
            };
            return Termination::Failed(server_error(status, &body));
        }

        let mut frames = FrameDecoder::new(response.body, self.protocol.framing());
        loop {
            if self.cancel.is_cancelled() {
                return Termination::Cancelled;
            }
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Termination::Cancelled,
                next = frames.next() => next,
            };
            let payload = match next {
                None => return Termination::Finished,
                Some(Err(err)) => return Termination::Failed(err),
                Some(Ok(payload)) => payload,
            };
            for event in self.protocol.normalize(&payload) {
                match event {
                    NormalizedEvent::TextDelta(text) => self.apply(text),
                    NormalizedEvent::Done => return Termination::Finished,
                    NormalizedEvent::Ignorable => {}
                }
            }
        }
    }

    fn apply(&self, text: String) {
        let subscribed = self.shared.has_subscribers();
        let accumulated = {
            let mut state = self.shared.state.lock();
            if !state.apply_delta(self.id, &text) {
                return;
            }
            subscribed.then(|| state.generation.accumulated_text.clone())
        };
        if let Some(accumulated) = accumulated {
            self.shared.publish(vec![SessionEvent::Partial {
                generation: self.id,
                accumulated,
            }]);
        }
        let _ = self.deltas.send(text);
    }
}

/// Caller-side handle to a running generation.
pub struct GenerationHandle {
    id: u64,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<Result<GenerationOutcome, BridgeError>>,
    deltas: mpsc::UnboundedReceiver<String>,
}

impl GenerationHandle {
    pub(crate) fn new(
        id: u64,
        cancel: CancellationToken,
        outcome: oneshot::Receiver<Result<GenerationOutcome, BridgeError>>,
        deltas: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            id,
            cancel,
            outcome,
            deltas,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cooperative cancellation; no frame is processed after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Awaits the settled outcome.
    ///
    /// # Errors
    ///
    /// Returns the failure that moved the generation to `Failed`, or
    /// [`BridgeError::Cancelled`] if the task was torn down without settling.
    pub async fn wait(self) -> Result<GenerationOutcome, BridgeError> {
        let Self {
            outcome, deltas, ..
        } = self;
        drop(deltas);
        outcome.await.unwrap_or(Err(BridgeError::Cancelled))
    }

    /// Converts the handle into a push stream of text deltas.
    pub fn into_text_stream(self) -> TextStream {
        let cancel = self.cancel.clone();
        let state = Some((self.deltas, self.outcome));
        let inner = futures_util::stream::unfold(state, |state| async move {
            let (mut deltas, outcome) = state?;
            if let Some(text) = deltas.recv().await {
                return Some((Ok(text), Some((deltas, outcome))));
            }
            match outcome.await {
                Ok(Err(err)) => Some((Err(err), None)),
                _ => None,
            }
        });
        TextStream {
            inner: Box::pin(inner),
            cancel,
        }
    }
}

/// Text deltas of one generation in arrival order.
///
/// Ends when the generation settles; a failure is yielded as the final item.
/// Cancellation and empty responses end the stream without an error.
pub struct TextStream {
    inner: Pin<Box<dyn Stream<Item = Result<String, BridgeError>> + Send>>,
    cancel: CancellationToken,
}

impl TextStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for TextStream {
    type Item = Result<String, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
