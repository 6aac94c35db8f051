// Integration tests for the session loop and routing engine, driven through
// a recording in-memory protocol client.

use async_trait::async_trait;
use carreton_core::atoms::types::{
    ClassifiedMessage, DeliveryType, DisconnectReason, InboundMessage, MessageContent, MessageKind,
    SendOptions, SessionEvent, TerminalCondition,
};
use carreton_core::engine::routing::RoutingEngine;
use carreton_core::engine::{KeywordSets, RoutingConfig};
use carreton_core::{
    spawn_session, EngineError, EngineResult, ProtocolClient, SessionExit, SessionSettings,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Mock client ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Sent {
    to: String,
    text: String,
    quoted: Option<String>,
}

#[derive(Default)]
struct MockClient {
    sent: Mutex<Vec<Sent>>,
    starts: AtomicUsize,
    logouts: AtomicUsize,
    failing_destinations: Mutex<HashSet<String>>,
    failing_starts: AtomicUsize,
    /// Calls that never complete, like an API that accepts the connection
    /// and never answers.
    hang_starts: AtomicBool,
    hang_sends: AtomicBool,
    hang_logouts: AtomicBool,
}

impl MockClient {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    fn sent_to(&self, conversation: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.to == conversation).collect()
    }

    fn fail_sends_to(&self, conversation: &str) {
        self.failing_destinations.lock().insert(conversation.to_string());
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start_session(&self) -> EngineResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.hang_starts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pending_failures = self.failing_starts.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_starts.store(pending_failures - 1, Ordering::SeqCst);
            return Err(EngineError::channel("mock", "start refused"));
        }
        Ok(())
    }

    async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
    ) -> EngineResult<()> {
        if self.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing_destinations.lock().contains(conversation_id) {
            return Err(EngineError::channel("mock", "send refused"));
        }
        self.sent.lock().push(Sent {
            to: conversation_id.to_string(),
            text: text.to_string(),
            quoted: options.quoted.map(|q| q.id),
        });
        Ok(())
    }

    async fn logout(&self) -> EngineResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        if self.hang_logouts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

const SOURCE: &str = "120363000000000001@g.us";
const DESTINATION: &str = "120363000000000002@g.us";
const OTHER: &str = "120363000000000003@g.us";

fn message(id: &str, conversation: &str, text: &str, from_me: bool) -> InboundMessage {
    InboundMessage {
        id: id.into(),
        conversation_id: conversation.into(),
        sender_id: "5491122223333@s.whatsapp.net".into(),
        push_name: Some("Ana".into()),
        from_me,
        content: Some(MessageContent { conversation: Some(text.into()), ..Default::default() }),
    }
}

fn batch(messages: Vec<InboundMessage>) -> SessionEvent {
    SessionEvent::MessageBatch { messages, delivery: DeliveryType::Notify }
}

fn settings() -> SessionSettings {
    SessionSettings { send_timeout: Duration::from_secs(5), ..Default::default() }
}

fn routed_settings() -> SessionSettings {
    SessionSettings { routing: configured_routing(), ..settings() }
}

fn configured_routing() -> RoutingConfig {
    RoutingConfig { source: Some(SOURCE.into()), destination: Some(DESTINATION.into()) }
}

fn engine(client: Arc<MockClient>, routing: RoutingConfig) -> RoutingEngine {
    RoutingEngine::new(client, routing, KeywordSets::default(), Duration::from_secs(5))
}

// ── Commands through the session loop ─────────────────────────────────

#[tokio::test]
async fn configure_then_status_reports_ready() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), settings());
    let tx = handle.events();

    tx.send(batch(vec![message("m1", SOURCE, "!setorigen", true)])).await.unwrap();
    tx.send(batch(vec![message("m2", DESTINATION, " !SETDESTINO ", false)])).await.unwrap();
    tx.send(batch(vec![message("m3", OTHER, "!status", false)])).await.unwrap();
    tx.send(SessionEvent::Shutdown).await.unwrap();

    let status = handle.status();
    drop(tx);
    assert_eq!(handle.wait().await, SessionExit::Shutdown);

    let snapshot = status.lock().clone();
    assert_eq!(snapshot.source_conversation_id.as_deref(), Some(SOURCE));
    assert_eq!(snapshot.destination_conversation_id.as_deref(), Some(DESTINATION));
    assert!(snapshot.ready);

    assert_eq!(client.sent_to(SOURCE).len(), 1);
    assert_eq!(client.sent_to(DESTINATION).len(), 1);
    let report = &client.sent_to(OTHER)[0].text;
    assert!(report.contains(SOURCE));
    assert!(report.contains(DESTINATION));
    assert!(report.contains("Listo para reenviar: Sí"));
    assert_eq!(client.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn solicitation_is_forwarded_and_registered_once() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), routed_settings());
    let tx = handle.events();

    let solicitation = message("3EB0C767D26A1D8E", SOURCE, "solicito turno", false);
    tx.send(batch(vec![solicitation])).await.unwrap();
    tx.send(batch(vec![message("m2", SOURCE, "!status", false)])).await.unwrap();
    tx.send(SessionEvent::Shutdown).await.unwrap();
    let status = handle.status();
    drop(tx);
    handle.wait().await;

    let forwarded = client.sent_to(DESTINATION);
    assert_eq!(forwarded.len(), 1);
    assert!(forwarded[0].text.contains("solicito turno"));
    assert!(forwarded[0].text.contains("Ana"));
    assert!(forwarded[0].text.contains("-3EB0C767"));

    let to_source = client.sent_to(SOURCE);
    assert_eq!(to_source.len(), 2);
    assert_eq!(to_source[0].quoted.as_deref(), Some("3EB0C767D26A1D8E"));
    assert!(to_source[1].text.contains("Pedidos registrados: 1"));
    assert_eq!(status.lock().registry_count, 1);
}

#[tokio::test]
async fn logout_stops_processing_the_rest_of_the_batch() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), routed_settings());
    let tx = handle.events();

    tx.send(batch(vec![
        message("m1", SOURCE, "!logout", true),
        message("m2", SOURCE, "solicito turno", false),
    ]))
    .await
    .unwrap();
    drop(tx);

    assert_eq!(handle.wait().await, SessionExit::LoggedOut);
    assert_eq!(client.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(client.sent().len(), 1);
    assert!(client.sent()[0].text.contains("Cerrando sesión"));
    assert!(client.sent_to(DESTINATION).is_empty());
}

#[tokio::test]
async fn history_batches_are_skipped() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), routed_settings());
    let tx = handle.events();

    tx.send(SessionEvent::MessageBatch {
        messages: vec![message("m1", SOURCE, "solicito turno", false)],
        delivery: DeliveryType::Append,
    })
    .await
    .unwrap();
    tx.send(SessionEvent::Shutdown).await.unwrap();
    drop(tx);
    handle.wait().await;

    assert!(client.sent().is_empty());
}

// ── Routing engine ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_carries_request_number() {
    let client = Arc::new(MockClient::default());
    let mut engine = engine(client.clone(), configured_routing());

    let notice = ClassifiedMessage {
        kind: MessageKind::CancellationNotice,
        sender_display_name: "Ana".into(),
        raw_text: "se cancela el pedido #42".into(),
        conversation_id: SOURCE.into(),
        is_self_originated: false,
        message_id: "m1".into(),
    };
    engine.route(&notice);
    engine.flush().await;

    let forwarded = client.sent_to(DESTINATION);
    assert_eq!(forwarded.len(), 1);
    assert!(forwarded[0].text.contains("#42"));
    assert_eq!(client.sent_to(SOURCE).len(), 1);
    assert!(engine.registry().is_empty());

    let without_number = ClassifiedMessage { raw_text: "se cancela todo".into(), ..notice };
    engine.route(&without_number);
    engine.flush().await;
    let forwarded = client.sent_to(DESTINATION);
    assert_eq!(forwarded.len(), 2);
    assert!(!forwarded[1].text.contains("Pedido:"));
}

#[tokio::test]
async fn unconfigured_destination_sends_nothing() {
    let client = Arc::new(MockClient::default());
    let routing = RoutingConfig { source: Some(SOURCE.into()), destination: None };
    let mut engine = engine(client.clone(), routing);

    engine.handle_message(&message("m1", SOURCE, "solicito turno", false)).await;
    engine.handle_message(&message("m2", SOURCE, "cancelado", false)).await;
    engine.flush().await;

    assert!(client.sent().is_empty());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn other_conversations_and_self_messages_are_not_routed() {
    let client = Arc::new(MockClient::default());
    let mut engine = engine(client.clone(), configured_routing());

    engine.handle_message(&message("m1", OTHER, "solicito turno", false)).await;
    engine.handle_message(&message("m2", SOURCE, "solicito turno", true)).await;
    engine.handle_message(&message("m3", SOURCE, "buen día", false)).await;
    engine.flush().await;

    assert!(client.sent().is_empty());
    assert_eq!(engine.registry().len(), 0);
}

#[tokio::test]
async fn failed_forward_is_contained() {
    let client = Arc::new(MockClient::default());
    client.fail_sends_to(DESTINATION);
    let mut engine = engine(client.clone(), configured_routing());

    engine
        .handle_batch(&[
            message("m1", SOURCE, "solicito turno", false),
            message("m2", SOURCE, "!status", false),
        ])
        .await;

    assert_eq!(engine.send_failures(), 1);
    assert!(engine.registry().is_empty());
    let to_source = client.sent_to(SOURCE);
    assert_eq!(to_source.len(), 1, "no acknowledgment for a failed forward");
    assert!(to_source[0].text.contains("Pedidos registrados: 0"));
}

#[tokio::test]
async fn failed_acknowledgment_still_registers() {
    let client = Arc::new(MockClient::default());
    client.fail_sends_to(SOURCE);
    let mut engine = engine(client.clone(), configured_routing());

    engine.handle_message(&message("m1", SOURCE, "solicito fecha", false)).await;
    engine.flush().await;

    assert_eq!(client.sent_to(DESTINATION).len(), 1);
    assert_eq!(engine.registry().len(), 1);
    assert_eq!(engine.send_failures(), 1);
}

// ── Reconnection through the session loop ─────────────────────────────

#[tokio::test(start_paused = true)]
async fn transient_close_restarts_after_backoff_and_open_resets() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), settings());
    let tx = handle.events();
    let status = handle.status();

    tx.send(SessionEvent::Closed { reason: DisconnectReason::ConnectionLost }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 1);
    assert_eq!(status.lock().reconnect_attempts, 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 2);

    let self_id = Some("5491100000000@s.whatsapp.net".to_string());
    tx.send(SessionEvent::Open { self_id }).await.unwrap();
    tx.send(SessionEvent::Shutdown).await.unwrap();
    drop(tx);
    handle.wait().await;

    let snapshot = status.lock().clone();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.self_id.as_deref(), Some("5491100000000@s.whatsapp.net"));
}

#[tokio::test]
async fn eleventh_close_is_not_retried() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), settings());
    let tx = handle.events();
    let status = handle.status();

    for _ in 0..11 {
        tx.send(SessionEvent::Closed { reason: DisconnectReason::ConnectionClosed }).await.unwrap();
    }
    tx.send(SessionEvent::Shutdown).await.unwrap();
    drop(tx);
    handle.wait().await;

    let snapshot = status.lock().clone();
    assert_eq!(snapshot.reconnect_attempts, 10);
    assert_eq!(snapshot.terminal, Some(TerminalCondition::ManualRestartRequired));
}

#[tokio::test(start_paused = true)]
async fn logged_out_waits_for_operator_restart() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), settings());
    let tx = handle.events();
    let status = handle.status();

    tx.send(SessionEvent::QrPresented { payload: "2@abc".into() }).await.unwrap();
    tx.send(SessionEvent::Closed { reason: DisconnectReason::LoggedOut }).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 1);
    {
        let snapshot = status.lock();
        assert_eq!(snapshot.terminal, Some(TerminalCondition::ReauthRequired));
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(snapshot.qr_code.is_none());
    }

    tx.send(SessionEvent::RestartRequested).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 2);
    assert_eq!(status.lock().terminal, None);

    tx.send(SessionEvent::Shutdown).await.unwrap();
    drop(tx);
    handle.wait().await;
}

#[tokio::test(start_paused = true)]
async fn failed_start_retries_after_fixed_delay() {
    let client = Arc::new(MockClient::default());
    client.failing_starts.store(1, Ordering::SeqCst);
    let handle = spawn_session(client.clone(), settings());
    let status = handle.status();

    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 1);
    assert_eq!(status.lock().reconnect_attempts, 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 2);

    handle.events().send(SessionEvent::Shutdown).await.unwrap();
    handle.wait().await;
}

#[tokio::test]
async fn duplicate_start_is_guarded_while_connecting() {
    let client = Arc::new(MockClient::default());
    let handle = spawn_session(client.clone(), settings());
    let tx = handle.events();
    let status = handle.status();

    // The initial start leaves the session connecting.
    tx.send(SessionEvent::RestartRequested).await.unwrap();
    tx.send(SessionEvent::Connecting).await.unwrap();
    tx.send(SessionEvent::RestartRequested).await.unwrap();
    tx.send(SessionEvent::Open { self_id: None }).await.unwrap();
    tx.send(SessionEvent::RestartRequested).await.unwrap();
    tx.send(SessionEvent::Closed { reason: DisconnectReason::LoggedOut }).await.unwrap();
    tx.send(SessionEvent::RestartRequested).await.unwrap();
    tx.send(SessionEvent::Shutdown).await.unwrap();
    drop(tx);
    handle.wait().await;

    // Only the request after the close reaches the client.
    assert_eq!(client.starts.load(Ordering::SeqCst), 2);
    assert_eq!(status.lock().terminal, None);
}

// ── Stalled client calls ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn hung_start_and_logout_do_not_block_shutdown() {
    let client = Arc::new(MockClient::default());
    client.hang_starts.store(true, Ordering::SeqCst);
    client.hang_logouts.store(true, Ordering::SeqCst);
    let control_timeout = Duration::from_secs(10);
    let handle = spawn_session(client.clone(), SessionSettings { control_timeout, ..settings() });
    let status = handle.status();

    handle.events().send(SessionEvent::Shutdown).await.unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(3600), handle.wait()).await;

    assert!(matches!(exit, Ok(SessionExit::Shutdown)));
    assert_eq!(client.starts.load(Ordering::SeqCst), 1);
    assert_eq!(client.logouts.load(Ordering::SeqCst), 1);
    // The timed-out start counted as a failed attempt.
    assert_eq!(status.lock().reconnect_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_sends_do_not_delay_reconnection() {
    let client = Arc::new(MockClient::default());
    client.hang_sends.store(true, Ordering::SeqCst);
    let handle = spawn_session(client.clone(), routed_settings());
    let tx = handle.events();

    let solicitations = (0..10)
        .map(|n| message(&format!("m{}", n), SOURCE, "solicito turno", false))
        .collect();
    tx.send(batch(solicitations)).await.unwrap();
    tx.send(SessionEvent::Closed { reason: DisconnectReason::ConnectionLost }).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(client.starts.load(Ordering::SeqCst), 2);

    tx.send(SessionEvent::Shutdown).await.unwrap();
    drop(tx);
    assert_eq!(handle.wait().await, SessionExit::Shutdown);
    assert!(client.sent().is_empty());
}
