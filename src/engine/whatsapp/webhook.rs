// WhatsApp Bridge — Webhook Event Translation
// translate_webhook, parse_inbound_message, extract_qr
//
// Evolution API posts `{ "event": "...", "instance": "...", "data": {...} }`.
// Older releases send upper-case names (`MESSAGES_UPSERT`); both spellings
// are accepted.

use carreton_core::atoms::types::{DeliveryType, DisconnectReason, InboundMessage, MessageContent, SessionEvent};
use log::{debug, warn};
use serde_json::Value;

/// Normalize `MESSAGES_UPSERT` / `messages.upsert` to the dotted form.
pub fn event_name(payload: &Value) -> String {
    payload["event"].as_str().unwrap_or("").to_lowercase().replace('_', ".")
}

/// Translate one webhook payload into zero or more session events.
pub fn translate_webhook(payload: &Value) -> Vec<SessionEvent> {
    let data = &payload["data"];
    match event_name(payload).as_str() {
        "qrcode.updated" => {
            let qr = extract_qr(data);
            if qr.is_empty() {
                warn!("[whatsapp] qrcode.updated without a QR payload");
                return vec![];
            }
            vec![SessionEvent::QrPresented { payload: qr }]
        }
        "connection.update" => translate_connection_update(payload).into_iter().collect(),
        "messages.upsert" => {
            let messages: Vec<InboundMessage> = match data.as_array() {
                Some(arr) => arr.iter().filter_map(parse_inbound_message).collect(),
                None => parse_inbound_message(data).into_iter().collect(),
            };
            if messages.is_empty() {
                return vec![];
            }
            // Evolution only forwards live upserts; honour an explicit type when present.
            let delivery = data["type"]
                .as_str()
                .or_else(|| payload["type"].as_str())
                .map(DeliveryType::parse)
                .unwrap_or(DeliveryType::Notify);
            vec![SessionEvent::MessageBatch { messages, delivery }]
        }
        "creds.update" => vec![SessionEvent::CredentialsUpdated],
        other => {
            debug!("[whatsapp] Ignoring webhook event '{}'", other);
            vec![]
        }
    }
}

fn translate_connection_update(payload: &Value) -> Option<SessionEvent> {
    let data = &payload["data"];
    match data["state"].as_str().unwrap_or("") {
        "open" | "connected" => {
            let self_id = data["wuid"]
                .as_str()
                .or_else(|| payload["sender"].as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(SessionEvent::Open { self_id })
        }
        "connecting" => Some(SessionEvent::Connecting),
        "close" | "closed" => {
            let code = data["statusReason"].as_u64().and_then(|c| u16::try_from(c).ok());
            Some(SessionEvent::Closed { reason: DisconnectReason::from_code(code) })
        }
        other => {
            debug!("[whatsapp] Unknown connection state '{}'", other);
            None
        }
    }
}

/// Extract the QR payload from the shapes Evolution API uses across versions:
/// `{ "qrcode": { "base64": ... } }`, `{ "base64": ... }`, `{ "qrcode": "data:..." }`,
/// `{ "qrcode": { "code": ... } }`.
pub fn extract_qr(value: &Value) -> String {
    value["qrcode"]["base64"]
        .as_str()
        .or_else(|| value["base64"].as_str())
        .or_else(|| value["qrcode"].as_str().filter(|s| !s.is_empty()))
        .or_else(|| value["qrcode"]["code"].as_str())
        .or_else(|| value["code"].as_str())
        .unwrap_or("")
        .to_string()
}

/// Convert one Baileys-shaped message into an `InboundMessage`. Returns `None`
/// when the key is incomplete.
pub fn parse_inbound_message(msg: &Value) -> Option<InboundMessage> {
    let key = &msg["key"];
    let remote_jid = key["remoteJid"].as_str().filter(|s| !s.is_empty())?;
    let id = key["id"].as_str().filter(|s| !s.is_empty())?;
    let from_me = key["fromMe"].as_bool().unwrap_or(false);

    // In groups the author is the participant; in direct chats the remote jid.
    let sender_id = key["participant"]
        .as_str()
        .or_else(|| msg["participant"].as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(remote_jid);

    let push_name = msg["pushName"].as_str().filter(|s| !s.trim().is_empty()).map(str::to_string);

    let content = msg["message"].as_object().map(|_| {
        let body = &msg["message"];
        let text = |v: &Value| v.as_str().map(str::to_string);
        MessageContent {
            conversation: text(&body["conversation"]),
            extended_text: text(&body["extendedTextMessage"]["text"]),
            image_caption: text(&body["imageMessage"]["caption"]),
            video_caption: text(&body["videoMessage"]["caption"]),
        }
    });

    Some(InboundMessage {
        id: id.to_string(),
        conversation_id: remote_jid.to_string(),
        sender_id: sender_id.to_string(),
        push_name,
        from_me,
        content,
    })
}
