// Carretón Engine — Routing Engine
//
// Consumes classified messages: admin commands go to the dispatcher,
// solicitations and cancellations from the configured source conversation
// are forwarded to the destination and acknowledged back to the source.
//
// Delivery is best-effort and at-most-once. Forwards are handed to the
// outbox writer and never awaited here; a failed send is logged and counted,
// never retried, and never stops the rest of the batch. Command replies are
// sent inline.

use super::classifier::{classify_message, KeywordSets};
use super::commands::{self, RoutingConfig};
use super::outbox::{send_with_timeout, ForwardJob, Outbox, Settled};
use super::registry::RequestRegistry;
use crate::atoms::constants::LOG_PREVIEW_CHARS;
use crate::atoms::traits::ProtocolClient;
use crate::atoms::types::{
    truncate_utf8, AdminCommand, ClassifiedMessage, InboundMessage, MessageKind, MessageRef,
    PedidoRecord, SendOptions,
};
use chrono::{DateTime, Local, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// `pedido #42`, `Solicitud # 7` — first match wins.
static REQUEST_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:pedido|solicitud)\s*#\s*(\d+)").expect("request number regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Continue,
    /// `!logout` was executed; stop processing events.
    LoggedOut,
}

pub struct RoutingEngine {
    client: Arc<dyn ProtocolClient>,
    routing: RoutingConfig,
    keywords: KeywordSets,
    registry: RequestRegistry,
    outbox: Outbox,
    send_timeout: Duration,
    send_failures: u64,
}

impl RoutingEngine {
    /// Spawns the outbox writer; call from within a tokio runtime.
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        routing: RoutingConfig,
        keywords: KeywordSets,
        send_timeout: Duration,
    ) -> Self {
        RoutingEngine {
            outbox: Outbox::spawn(client.clone(), send_timeout),
            client,
            routing,
            keywords,
            registry: RequestRegistry::new(),
            send_timeout,
            send_failures: 0,
        }
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn keywords(&self) -> &KeywordSets {
        &self.keywords
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }

    /// Process one batch in order. Stops early on `!logout`.
    pub async fn handle_batch(&mut self, messages: &[InboundMessage]) -> BatchOutcome {
        for msg in messages {
            if self.handle_message(msg).await == BatchOutcome::LoggedOut {
                return BatchOutcome::LoggedOut;
            }
        }
        BatchOutcome::Continue
    }

    pub async fn handle_message(&mut self, msg: &InboundMessage) -> BatchOutcome {
        let classified = classify_message(msg, &self.keywords);
        debug!(
            "[routing] {:?} from {} in {}: {}",
            classified.kind,
            classified.sender_display_name,
            classified.conversation_id,
            truncate_utf8(&classified.raw_text, LOG_PREVIEW_CHARS)
        );

        match classified.kind {
            MessageKind::AdminCommand(cmd) => self.run_command(cmd, &classified).await,
            MessageKind::Ignored => BatchOutcome::Continue,
            MessageKind::CancellationNotice | MessageKind::SolicitationRequest => {
                self.route(&classified);
                BatchOutcome::Continue
            }
        }
    }

    /// Dispatch and reply. The caller performs the logout on `LoggedOut`.
    async fn run_command(&mut self, cmd: AdminCommand, msg: &ClassifiedMessage) -> BatchOutcome {
        // Queued forwards get one send timeout to settle so `!status` counts them.
        if tokio::time::timeout(self.send_timeout, self.flush()).await.is_err() {
            warn!("[routing] Forwards still in flight while running {:?}", cmd);
        }

        let reply = commands::dispatch(
            cmd,
            &msg.conversation_id,
            &mut self.routing,
            &self.keywords,
            self.registry.len(),
        );
        self.send_logged(&msg.conversation_id, &reply.text, SendOptions::default()).await;

        if reply.terminates_session {
            info!("[routing] Logout requested from {}", msg.conversation_id);
            return BatchOutcome::LoggedOut;
        }
        BatchOutcome::Continue
    }

    /// Queue a solicitation or cancellation for forwarding. Silently does
    /// nothing when routing is not configured or the message is from
    /// another conversation.
    pub fn route(&mut self, msg: &ClassifiedMessage) {
        if msg.is_self_originated {
            return;
        }
        let Some((source, destination)) = self.routing.route_pair() else {
            debug!("[routing] Not configured — skipping message {}", msg.message_id);
            return;
        };
        if msg.conversation_id != source {
            return;
        }
        let (source, destination) = (source.to_string(), destination.to_string());

        let job = match msg.kind {
            MessageKind::CancellationNotice => cancellation_job(msg, source, destination),
            MessageKind::SolicitationRequest => self.solicitation_job(msg, source, destination),
            _ => return,
        };
        self.enqueue(job);
    }

    fn solicitation_job(
        &mut self,
        msg: &ClassifiedMessage,
        source: String,
        destination: String,
    ) -> ForwardJob {
        let created_at = Utc::now();
        let id = self.registry.reserve(created_at, &msg.message_id);
        ForwardJob {
            label: format!("Solicitation {} from {}", id, msg.sender_display_name),
            destination,
            text: compose_solicitation(&msg.sender_display_name, created_at, &id, &msg.raw_text),
            source,
            ack: format!("✅ Solicitud recibida y reenviada.\n🆔 {}", id),
            quoted: message_ref(msg),
            record: Some(PedidoRecord {
                id,
                sender_display_name: msg.sender_display_name.clone(),
                raw_text: msg.raw_text.clone(),
                created_at,
                original_message_id: msg.message_id.clone(),
            }),
        }
    }

    fn enqueue(&mut self, job: ForwardJob) {
        let label = job.label.clone();
        let reserved = job.record.as_ref().map(|r| r.id.clone());
        if self.outbox.enqueue(job) {
            return;
        }
        error!("[routing] Dropped {}", label);
        self.send_failures += 1;
        if let Some(id) = reserved {
            self.registry.release(&id);
        }
    }

    /// Next outcome from the outbox writer. Cancel safe.
    pub async fn next_settled(&mut self) -> Option<Settled> {
        self.outbox.next_settled().await
    }

    /// Apply a writer outcome: register a forwarded solicitation or free
    /// its reserved id, and count failed sends.
    pub fn settle(&mut self, settled: Settled) {
        self.send_failures += settled.failures;
        let Some(record) = settled.record else {
            return;
        };
        if settled.forwarded {
            self.registry.insert(record);
        } else {
            self.registry.release(&record.id);
        }
    }

    /// Wait for every queued forward and apply the outcomes.
    pub async fn flush(&mut self) {
        for settled in self.outbox.flush().await {
            self.settle(settled);
        }
    }

    /// Send with a timeout. Failures are logged and counted; returns success.
    async fn send_logged(&mut self, conversation_id: &str, text: &str, options: SendOptions) -> bool {
        let client = self.client.as_ref();
        match send_with_timeout(client, self.send_timeout, conversation_id, text, options).await {
            Ok(()) => true,
            Err(e) => {
                self.send_failures += 1;
                error!("[routing] Send to {} via {} failed: {}", conversation_id, client.name(), e);
                false
            }
        }
    }
}

fn cancellation_job(msg: &ClassifiedMessage, source: String, destination: String) -> ForwardJob {
    let number = extract_request_number(&msg.raw_text);
    ForwardJob {
        label: match number {
            Some(n) => format!("Cancellation of pedido #{} from {}", n, msg.sender_display_name),
            None => format!("Cancellation from {}", msg.sender_display_name),
        },
        destination,
        text: compose_cancellation(&msg.sender_display_name, number, &msg.raw_text),
        source,
        ack: "✅ Cancelación recibida y notificada.".to_string(),
        quoted: message_ref(msg),
        record: None,
    }
}

fn message_ref(msg: &ClassifiedMessage) -> MessageRef {
    MessageRef {
        id: msg.message_id.clone(),
        conversation_id: msg.conversation_id.clone(),
        from_me: msg.is_self_originated,
        text: msg.raw_text.clone(),
    }
}

// ── Composition ────────────────────────────────────────────────────────

/// Digits after `pedido #` / `solicitud #`, kept verbatim so numbers of any
/// length survive.
pub fn extract_request_number(text: &str) -> Option<&str> {
    REQUEST_NUMBER_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub fn compose_cancellation(sender: &str, request_number: Option<&str>, text: &str) -> String {
    let number_line = request_number
        .map(|n| format!("🔢 *Pedido:* #{}\n", n))
        .unwrap_or_default();
    format!(
        "❌ *CANCELACIÓN*\n\n\
         👤 *De:* {}\n\
         {}\n\
         💬 *Mensaje:*\n{}",
        sender, number_line, text
    )
}

pub fn compose_solicitation(
    sender: &str,
    created_at: DateTime<Utc>,
    id: &str,
    text: &str,
) -> String {
    let local = created_at.with_timezone(&Local);
    format!(
        "📋 *NUEVA SOLICITUD*\n\n\
         👤 *De:* {}\n\
         🕐 *Fecha:* {}\n\
         🆔 *ID:* {}\n\n\
         💬 *Mensaje:*\n{}",
        sender,
        local.format("%d/%m/%Y %H:%M:%S"),
        id,
        text
    )
}
