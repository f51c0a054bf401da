use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chat_bridge::generation::FAILED_RESPONSE;
use chat_bridge::http::{
    HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport,
};
use chat_bridge::{
    AttachedImage, BridgeError, GenerationOutcome, GenerationPhase, Role, Session, SessionConfig,
    SessionEvent, Target,
};
use futures_util::{StreamExt, stream};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

type BodySender = mpsc::UnboundedSender<Result<Vec<u8>, BridgeError>>;

enum Reply {
    Stream { status: u16, body: HttpBodyStream },
    Fail(&'static str),
}

/// Serves queued streaming replies in order and records every request it sees.
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
    models_body: &'static str,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            models_body: r#"{"models":[{"name":"llama3.2"}]}"#,
        })
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("lock").clone()
    }

    fn body_json(&self, index: usize) -> Value {
        let requests = self.requests();
        serde_json::from_slice(requests[index].body.as_deref().expect("body")).expect("json")
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        self.requests.lock().expect("lock").push(request);
        Ok(HttpResponse {
            status: 200,
            headers: Default::default(),
            body: self.models_body.as_bytes().to_vec(),
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, BridgeError> {
        self.requests.lock().expect("lock").push(request);
        let reply = self
            .replies
            .lock()
            .expect("lock")
            .pop_front()
            .expect("a scripted reply for every stream request");
        match reply {
            Reply::Stream { status, body } => Ok(HttpStreamResponse {
                status,
                headers: Default::default(),
                body,
            }),
            Reply::Fail(message) => Err(BridgeError::transport(message)),
        }
    }
}

fn lines(chunks: &[&str]) -> Reply {
    status_lines(200, chunks)
}

fn status_lines(status: u16, chunks: &[&str]) -> Reply {
    let chunks: Vec<Result<Vec<u8>, BridgeError>> = chunks
        .iter()
        .map(|chunk| Ok(chunk.as_bytes().to_vec()))
        .collect();
    Reply::Stream {
        status,
        body: Box::pin(stream::iter(chunks)),
    }
}

/// A body whose chunks are pushed by the test while the generation runs.
fn live_body() -> (BodySender, Reply) {
    let (tx, rx) = mpsc::unbounded_channel();
    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (
        tx,
        Reply::Stream {
            status: 200,
            body: Box::pin(body),
        },
    )
}

fn session(config: SessionConfig, transport: &Arc<ScriptedTransport>) -> Session {
    Session::new(config, transport.clone())
}

async fn wait_for_partial(events: &mut broadcast::Receiver<SessionEvent>, expected: &str) {
    loop {
        match events.recv().await.expect("event channel open") {
            SessionEvent::Partial { accumulated, .. } if accumulated == expected => return,
            _ => {}
        }
    }
}

#[tokio::test]
async fn ollama_json_lines_accumulate_into_one_reply() {
    let transport = ScriptedTransport::new(vec![lines(&[
        "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
        "{\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":true}\n",
    ])]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let reply = session
        .send_message("hello", None, None)
        .await
        .expect("reply");
    assert_eq!(reply.content, "Hi there");
    assert_eq!(reply.role, Role::Assistant);

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1], reply);
    assert_eq!(session.phase(), GenerationPhase::Idle);

    let request = &transport.requests()[0];
    assert_eq!(request.url, "http://localhost:11434/api/chat");
    assert_eq!(
        request.headers.get("Accept").map(String::as_str),
        Some("application/json")
    );
    let body = transport.body_json(0);
    assert_eq!(body["model"], "llama3.2");
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn claude_sse_deltas_accumulate_until_message_stop() {
    let transport = ScriptedTransport::new(vec![lines(&[
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"A\"}}\n\n",
        ": keep-alive\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"B\"}}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ])]);
    let config = SessionConfig::new(Target::Claude).with_api_key("sk-ant");
    let session = session(config, &transport);

    let reply = session.send_message("hi", None, None).await.expect("reply");
    assert_eq!(reply.content, "AB");

    let request = &transport.requests()[0];
    assert_eq!(request.url, "https://api.anthropic.com/v1/messages");
    assert_eq!(
        request.headers.get("x-api-key").map(String::as_str),
        Some("sk-ant")
    );
    assert_eq!(
        request.headers.get("anthropic-version").map(String::as_str),
        Some("2023-06-01")
    );
    assert_eq!(transport.body_json(0)["max_tokens"], 4096);
}

#[tokio::test]
async fn openai_stream_stops_at_done_sentinel() {
    let transport = ScriptedTransport::new(vec![lines(&[
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"!!\"}}]}\n\n",
    ])]);
    let config = SessionConfig::new(Target::OpenAi)
        .with_api_key("sk-test")
        .with_model("gpt-4o");
    let session = session(config, &transport);

    let image = AttachedImage::from_base64("QUJD");
    let reply = session
        .send_message("look", Some(image.clone()), None)
        .await
        .expect("reply");
    assert_eq!(reply.content, "Hello");
    assert_eq!(session.history()[0].attached_image, Some(image));

    let body = transport.body_json(0);
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(
        body["messages"][0]["content"][1]["image_url"]["url"],
        "data:image/jpeg;base64,QUJD"
    );
    let request = &transport.requests()[0];
    assert_eq!(
        request.headers.get("Authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
}

#[tokio::test]
async fn model_override_wins_over_configured_model() {
    let transport = ScriptedTransport::new(vec![lines(&[
        "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n",
    ])]);
    let config = SessionConfig::new(Target::LmStudio)
        .with_port(5000)
        .with_model("qwen2.5");
    let session = session(config, &transport);

    session
        .send_message("hi", None, Some("mistral-7b"))
        .await
        .expect("reply");
    assert_eq!(transport.body_json(0)["model"], "mistral-7b");
    assert_eq!(
        transport.requests()[0].url,
        "http://localhost:5000/v1/chat/completions"
    );
}

#[tokio::test]
async fn malformed_frame_does_not_abort_the_stream() {
    let transport = ScriptedTransport::new(vec![lines(&[
        "{\"message\":{\"content\":\"good \"}}\n",
        "{\"message\":{\"content\":\n",
        "{\"message\":{\"content\":\"frames\"},\"done\":true}\n",
    ])]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let reply = session.send_message("hi", None, None).await.expect("reply");
    assert_eq!(reply.content, "good frames");
}

#[tokio::test]
async fn prior_turns_are_sent_as_context() {
    let transport = ScriptedTransport::new(vec![
        lines(&["{\"message\":{\"content\":\"first answer\"},\"done\":true}\n"]),
        lines(&["{\"message\":{\"content\":\"second answer\"},\"done\":true}\n"]),
    ]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    session.send_message("one", None, None).await.expect("first");
    session.send_message("two", None, None).await.expect("second");

    let body = transport.body_json(1);
    let contents: Vec<&str> = body["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .map(|message| message["content"].as_str().expect("content"))
        .collect();
    assert_eq!(contents, vec!["one", "first answer", "two"]);
    assert_eq!(session.history().len(), 4);
}

#[tokio::test]
async fn empty_stream_returns_sentinel_without_recording_it() {
    let transport = ScriptedTransport::new(vec![lines(&["{\"done\":true}\n"])]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let reply = session.send_message("hi", None, None).await.expect("reply");
    assert_eq!(reply.content, FAILED_RESPONSE);
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn cancelling_mid_stream_keeps_annotated_partial_and_ignores_later_frames() {
    let (tx, reply) = live_body();
    let transport = ScriptedTransport::new(vec![reply]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);
    let mut events = session.subscribe();

    let handle = session
        .start_generation("tell me a story", None, None)
        .await
        .expect("started");
    assert_eq!(session.phase(), GenerationPhase::Streaming);

    tx.send(Ok(b"{\"message\":{\"content\":\"partial\"}}\n".to_vec()))
        .expect("send");
    wait_for_partial(&mut events, "partial").await;

    assert!(session.cancel_generation().await);
    let _ = tx.send(Ok(b"{\"message\":{\"content\":\" more\"}}\n".to_vec()));

    match handle.wait().await.expect("outcome") {
        GenerationOutcome::Cancelled {
            partial: Some(message),
        } => assert_eq!(message.content, "partial\nCancelled by user."),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let history = session.history();
    let assistant: Vec<_> = history
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "partial\nCancelled by user.");
    assert!(!session.generation_state().is_active);
}

#[tokio::test]
async fn cancelling_before_any_text_records_nothing() {
    let (_tx, reply) = live_body();
    let transport = ScriptedTransport::new(vec![reply]);
    let session = session(SessionConfig::new(Target::LmStudio), &transport);

    let handle = session
        .start_generation("hi", None, None)
        .await
        .expect("started");
    handle.cancel();

    assert!(matches!(
        handle.wait().await,
        Ok(GenerationOutcome::Cancelled { partial: None })
    ));
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn send_message_reports_cancellation_as_error() {
    let (_tx, reply) = live_body();
    let transport = ScriptedTransport::new(vec![reply]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let canceller = session.clone();
    let mut events = session.subscribe();
    let pending = tokio::spawn(async move { session.send_message("hi", None, None).await });
    loop {
        if let SessionEvent::GenerationStarted { .. } = events.recv().await.expect("event") {
            break;
        }
    }
    canceller.cancel_generation().await;

    let result = pending.await.expect("join");
    assert!(matches!(result, Err(BridgeError::Cancelled)));
}

#[tokio::test]
async fn starting_a_new_generation_cancels_and_settles_the_previous_one() {
    let (tx, first) = live_body();
    let transport = ScriptedTransport::new(vec![
        first,
        lines(&["{\"message\":{\"content\":\"two\"},\"done\":true}\n"]),
    ]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);
    let mut events = session.subscribe();

    let first = session
        .start_generation("first", None, None)
        .await
        .expect("first");
    tx.send(Ok(b"{\"message\":{\"content\":\"one\"}}\n".to_vec()))
        .expect("send");
    wait_for_partial(&mut events, "one").await;

    let second = session
        .send_message("second", None, None)
        .await
        .expect("second");
    assert_eq!(second.content, "two");
    assert!(matches!(
        first.wait().await,
        Ok(GenerationOutcome::Cancelled { partial: Some(_) })
    ));

    let contents: Vec<String> = session
        .history()
        .into_iter()
        .map(|message| message.content)
        .collect();
    assert_eq!(
        contents,
        vec![
            "first".to_string(),
            "one\nCancelled by user.".to_string(),
            "second".to_string(),
            "two".to_string(),
        ]
    );
    assert_eq!(
        transport.body_json(1)["messages"].as_array().map(Vec::len),
        Some(3)
    );
}

#[tokio::test]
async fn transport_failure_mid_stream_flushes_partial_then_surfaces_error() {
    let transport = ScriptedTransport::new(vec![Reply::Stream {
        status: 200,
        body: Box::pin(stream::iter(vec![
            Ok(b"{\"message\":{\"content\":\"half\"}}\n".to_vec()),
            Err(BridgeError::transport("connection reset")),
        ])),
    }]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let err = session.send_message("hi", None, None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Transport { .. }));

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[1].content,
        "half\nError: transport error: connection reset"
    );
    assert_eq!(
        session.generation_state().last_error.as_deref(),
        Some("transport error: connection reset")
    );
}

#[tokio::test]
async fn connection_failure_before_streaming_records_no_reply() {
    let transport = ScriptedTransport::new(vec![Reply::Fail("connection refused")]);
    let session = session(SessionConfig::new(Target::LmStudio), &transport);

    let err = session.send_message("hi", None, None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Transport { .. }));
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn non_200_status_is_a_server_error() {
    let transport = ScriptedTransport::new(vec![status_lines(
        401,
        &[r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#],
    )]);
    let config = SessionConfig::new(Target::OpenAi).with_api_key("sk-bad");
    let session = session(config, &transport);

    match session.send_message("hi", None, None).await {
        Err(BridgeError::ServerError { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message.as_deref(), Some("Incorrect API key provided"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(session.history().len(), 1);
    assert!(session.generation_state().last_error.is_some());
}

#[tokio::test]
async fn cancel_is_not_held_up_by_an_open_error_body() {
    let transport = ScriptedTransport::new(vec![
        Reply::Stream {
            status: 500,
            body: Box::pin(stream::pending::<Result<Vec<u8>, BridgeError>>()),
        },
        lines(&["{\"message\":{\"content\":\"recovered\"},\"done\":true}\n"]),
    ]);
    let config = SessionConfig::new(Target::Ollama).with_request_timeout(None);
    let session = session(config, &transport);
    let mut events = session.subscribe();

    let handle = session
        .start_generation("hi", None, None)
        .await
        .expect("started");
    while transport.requests().is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(session.phase(), GenerationPhase::Streaming);

    assert!(session.cancel_generation().await);
    assert!(matches!(
        handle.wait().await,
        Ok(GenerationOutcome::Cancelled { partial: None })
    ));
    assert_eq!(session.phase(), GenerationPhase::Idle);
    assert_eq!(session.history().len(), 1);
    loop {
        if let SessionEvent::GenerationSettled { phase, .. } = events.recv().await.expect("event") {
            assert_eq!(phase, GenerationPhase::Cancelled);
            break;
        }
    }

    let reply = session.send_message("again", None, None).await.expect("reply");
    assert_eq!(reply.content, "recovered");
}

#[tokio::test]
async fn missing_credential_is_deferred_to_first_request() {
    for target in [Target::Claude, Target::OpenAi] {
        let transport = ScriptedTransport::new(Vec::new());
        let session = session(SessionConfig::new(target), &transport);

        let err = session.send_message("hi", None, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingCredential { .. }));
        let err = session.list_models().await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingCredential { .. }));

        assert!(session.history().is_empty());
        assert!(transport.requests().is_empty());
    }
}

#[tokio::test]
async fn clear_discards_history_and_last_error() {
    let transport = ScriptedTransport::new(vec![
        lines(&["{\"message\":{\"content\":\"hey\"},\"done\":true}\n"]),
        status_lines(500, &["{\"error\":\"boom\"}"]),
    ]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);
    let mut events = session.subscribe();

    session.send_message("hi", None, None).await.expect("reply");
    assert!(session.send_message("again", None, None).await.is_err());
    assert!(session.generation_state().last_error.is_some());

    session.clear_messages().expect("clear");
    assert!(session.history().is_empty());
    assert_eq!(session.generation_state().last_error, None);

    let mut saw_cleared = false;
    while let Ok(event) = events.try_recv() {
        saw_cleared |= event == SessionEvent::Cleared;
    }
    assert!(saw_cleared);
}

#[tokio::test]
async fn clear_is_rejected_while_streaming() {
    let (tx, reply) = live_body();
    let transport = ScriptedTransport::new(vec![reply]);
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let handle = session
        .start_generation("hi", None, None)
        .await
        .expect("started");
    assert!(matches!(
        session.clear_messages(),
        Err(BridgeError::GenerationActive)
    ));
    assert_eq!(session.history().len(), 1);

    session.cancel_generation().await;
    drop(tx);
    handle.wait().await.expect("outcome");
    session.clear_messages().expect("clear after settling");
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn text_stream_pushes_deltas_in_arrival_order() {
    let transport = ScriptedTransport::new(vec![lines(&[
        "data: {\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"two \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"three\"}}]}\n\n",
        "data: [DONE]\n\n",
    ])]);
    let session = session(SessionConfig::new(Target::LmStudio), &transport);

    let deltas: Vec<String> = session
        .stream_message("count", None, None)
        .await
        .expect("stream")
        .map(|delta| delta.expect("delta"))
        .collect()
        .await;
    assert_eq!(deltas, vec!["one ", "two ", "three"]);
    assert_eq!(session.history()[1].content, "one two three");
}

#[tokio::test]
async fn text_stream_ends_with_the_failure() {
    let transport = ScriptedTransport::new(vec![status_lines(503, &["{}"])]);
    let session = session(SessionConfig::new(Target::LmStudio), &transport);

    let items: Vec<_> = session
        .stream_message("hi", None, None)
        .await
        .expect("stream")
        .collect()
        .await;
    assert_eq!(items.len(), 1);
    assert!(matches!(
        items[0],
        Err(BridgeError::ServerError { status: 503, .. })
    ));
}

#[tokio::test]
async fn listing_models_never_touches_history() {
    let transport = ScriptedTransport::new(Vec::new());
    let session = session(SessionConfig::new(Target::Ollama), &transport);

    let first = session.list_models().await.expect("models");
    let second = session.list_models().await.expect("models");
    assert_eq!(first, second);
    assert_eq!(first, vec!["llama3.2".to_string()]);
    assert!(session.history().is_empty());
    assert_eq!(session.generation_state().accumulated_text, "");
}
