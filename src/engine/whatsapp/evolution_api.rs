// WhatsApp Bridge — Evolution API Client
// EvolutionClient: create/connect/delete instance, sendText, logout

use async_trait::async_trait;
use carreton_core::atoms::constants::LOG_PREVIEW_CHARS;
use carreton_core::atoms::types::{truncate_utf8, SendOptions, SessionEvent};
use carreton_core::{EngineError, EngineResult, ProtocolClient};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::EvolutionConfig;
use super::webhook::extract_qr;

const CHANNEL: &str = "whatsapp";

/// Webhook events the relay consumes.
const WEBHOOK_EVENTS: &[&str] =
    &["QRCODE_UPDATED", "CONNECTION_UPDATE", "MESSAGES_UPSERT", "CREDS_UPDATE"];

pub struct EvolutionClient {
    config: EvolutionConfig,
    webhook_url: String,
    http: reqwest::Client,
    /// Session queue for events discovered while starting (initial QR,
    /// already-open instance). Weak so the client never keeps the queue alive.
    events: Mutex<Option<mpsc::WeakSender<SessionEvent>>>,
}

impl EvolutionClient {
    /// `request_timeout` bounds every HTTP request made to the API.
    pub fn new(
        config: EvolutionConfig,
        webhook_url: String,
        request_timeout: Duration,
    ) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(EvolutionClient { config, webhook_url, http, events: Mutex::new(None) })
    }

    pub fn attach(&self, events: &mpsc::Sender<SessionEvent>) {
        *self.events.lock() = Some(events.downgrade());
    }

    /// Never awaits: this runs inside the session loop, which is the queue's
    /// only consumer.
    fn emit(&self, event: SessionEvent) {
        let Some(tx) = self.events.lock().as_ref().and_then(|w| w.upgrade()) else {
            debug!("[whatsapp] No session attached — dropping {:?}", event);
            return;
        };
        if let Err(e) = tx.try_send(event) {
            warn!("[whatsapp] Could not queue session event: {}", e);
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    // ── Instance Management ────────────────────────────────────────────

    fn create_body(&self) -> Value {
        // A unique token per attempt avoids "Token already exists" collisions.
        let token = format!("carreton-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        json!({
            "instanceName": self.config.instance_name,
            "token": token,
            "qrcode": true,
            "webhook": self.webhook_url,
            "webhook_by_events": false,
            "events": WEBHOOK_EVENTS,
        })
    }

    /// Create the instance. `Ok(Some(qr))` on success, `Ok(None)` when the
    /// instance (or its token) already exists.
    async fn create_instance(&self) -> EngineResult<Option<String>> {
        info!("[whatsapp] Creating instance '{}'", self.config.instance_name);
        let resp = self
            .http
            .post(self.url("/instance/create"))
            .header("apikey", &self.config.api_key)
            .json(&self.create_body())
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        debug!("[whatsapp] Instance create response [{}]: {}", status, truncate_utf8(&text, 500));

        if status.is_success() {
            let body: Value = serde_json::from_str(&text).unwrap_or_default();
            return Ok(Some(extract_qr(&body)));
        }
        if is_conflict(&text) {
            return Ok(None);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let msg = format!("Evolution API rejected the API key ({})", status);
            return Err(EngineError::Auth(msg));
        }
        let msg = format!("Create instance failed ({}): {}", status, truncate_utf8(&text, 200));
        Err(EngineError::channel(CHANNEL, msg))
    }

    /// Reconnect an existing instance, keeping its credentials. Returns the
    /// QR when the instance needs to be paired again.
    async fn connect_instance(&self) -> EngineResult<String> {
        let resp = self
            .http
            .get(self.url(&format!("/instance/connect/{}", self.config.instance_name)))
            .header("apikey", &self.config.api_key)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        debug!("[whatsapp] Connect instance response [{}]: {}", status, truncate_utf8(&text, 500));
        if !status.is_success() {
            let msg = format!("Connect instance failed ({})", status);
            return Err(EngineError::channel(CHANNEL, msg));
        }

        let body: Value = serde_json::from_str(&text)?;
        if is_open_state(&body) {
            info!("[whatsapp] Instance '{}' already connected", self.config.instance_name);
            self.emit(SessionEvent::Open { self_id: None });
        }
        Ok(extract_qr(&body))
    }

    async fn delete_instance(&self) {
        let url = self.url(&format!("/instance/delete/{}", self.config.instance_name));
        match self.http.delete(&url).header("apikey", &self.config.api_key).send().await {
            Ok(resp) => info!("[whatsapp] Delete instance response [{}]", resp.status()),
            Err(e) => warn!("[whatsapp] Delete instance failed: {}", e),
        }
        // Let the API settle before recreating.
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    async fn open_instance(&self) -> EngineResult<String> {
        if let Some(qr) = self.create_instance().await? {
            return Ok(qr);
        }
        info!("[whatsapp] Instance '{}' exists — reconnecting", self.config.instance_name);
        match self.connect_instance().await {
            Ok(qr) => Ok(qr),
            Err(e) => {
                warn!("[whatsapp] Reconnect failed ({}), deleting instance and recreating", e);
                self.delete_instance().await;
                self.create_instance().await?.ok_or_else(|| {
                    EngineError::channel(CHANNEL, "Create instance still conflicts after delete")
                })
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for EvolutionClient {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn start_session(&self) -> EngineResult<()> {
        let qr = self.open_instance().await?;
        if !qr.is_empty() {
            info!("[whatsapp] QR code received ({} bytes) — waiting for scan", qr.len());
            self.emit(SessionEvent::QrPresented { payload: qr });
        }
        Ok(())
    }

    async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
    ) -> EngineResult<()> {
        let body = send_text_body(conversation_id, text, &options);
        let resp = self
            .http
            .post(self.url(&format!("/message/sendText/{}", self.config.instance_name)))
            .header("apikey", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.unwrap_or_default();
            return Err(EngineError::channel(
                CHANNEL,
                format!("sendText failed ({}): {}", status, truncate_utf8(&err_text, 200)),
            ));
        }
        let preview = truncate_utf8(text, LOG_PREVIEW_CHARS);
        debug!("[whatsapp] Sent to {}: {}", conversation_id, preview);
        Ok(())
    }

    async fn logout(&self) -> EngineResult<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/instance/logout/{}", self.config.instance_name)))
            .header("apikey", &self.config.api_key)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::channel(CHANNEL, format!("Logout failed ({})", status)));
        }
        info!("[whatsapp] Instance '{}' logged out", self.config.instance_name);
        Ok(())
    }
}

// ── Payload helpers ────────────────────────────────────────────────────

fn is_conflict(text: &str) -> bool {
    let lower = text.to_lowercase();
    let instance_exists =
        lower.contains("instance") && (lower.contains("already") || lower.contains("exists"));
    let token_exists = lower.contains("token") && lower.contains("already");
    instance_exists || token_exists
}

fn is_open_state(body: &Value) -> bool {
    let state = body["instance"]["state"].as_str().or_else(|| body["state"].as_str()).unwrap_or("");
    state == "open" || state == "connected"
}

pub(crate) fn send_text_body(conversation_id: &str, text: &str, options: &SendOptions) -> Value {
    let mut body = json!({
        "number": conversation_id,
        "text": text,
    });
    if let Some(quoted) = &options.quoted {
        body["quoted"] = json!({
            "key": {
                "remoteJid": quoted.conversation_id,
                "fromMe": quoted.from_me,
                "id": quoted.id,
            },
            "message": { "conversation": quoted.text },
        });
    }
    body
}
