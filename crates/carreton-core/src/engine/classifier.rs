// Carretón Engine — Message Classifier
//
// Maps an inbound message to one of: admin command, cancellation notice,
// solicitation request, or ignored. Pure functions, no state.
//
// Priority (after trim + lowercase):
//   1. exact admin command token  → AdminCommand (even when sent by us)
//   2. self-originated            → Ignored
//   3. cancellation keyword       → CancellationNotice
//   4. solicitation keyword       → SolicitationRequest
//   5. otherwise                  → Ignored

use crate::atoms::constants::{DEFAULT_CANCELLATION_KEYWORDS, DEFAULT_SOLICITATION_KEYWORDS};
use crate::atoms::types::{
    AdminCommand, ClassifiedMessage, InboundMessage, MessageContent, MessageKind,
};
use serde::{Deserialize, Serialize};

// ── Keyword sets ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordSets {
    pub cancellation: Vec<String>,
    pub solicitation: Vec<String>,
}

impl Default for KeywordSets {
    fn default() -> Self {
        KeywordSets {
            cancellation: DEFAULT_CANCELLATION_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            solicitation: DEFAULT_SOLICITATION_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl KeywordSets {
    pub fn matches_cancellation(&self, normalized: &str) -> bool {
        contains_any(normalized, &self.cancellation)
    }

    pub fn matches_solicitation(&self, normalized: &str) -> bool {
        contains_any(normalized, &self.solicitation)
    }
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|kw| {
        let kw = normalize(kw);
        !kw.is_empty() && haystack.contains(&kw)
    })
}

// ── Classification ─────────────────────────────────────────────────────

pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// First non-empty of: body, extended text, image caption, video caption.
pub fn extract_text(content: &MessageContent) -> &str {
    [
        &content.conversation,
        &content.extended_text,
        &content.image_caption,
        &content.video_caption,
    ]
    .into_iter()
    .filter_map(|field| field.as_deref())
    .find(|s| !s.is_empty())
    .unwrap_or("")
}

pub fn classify(text: &str, is_from_self: bool, keywords: &KeywordSets) -> MessageKind {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return MessageKind::Ignored;
    }
    if let Some(cmd) = AdminCommand::from_token(&normalized) {
        return MessageKind::AdminCommand(cmd);
    }
    if is_from_self {
        return MessageKind::Ignored;
    }
    if keywords.matches_cancellation(&normalized) {
        return MessageKind::CancellationNotice;
    }
    if keywords.matches_solicitation(&normalized) {
        return MessageKind::SolicitationRequest;
    }
    MessageKind::Ignored
}

/// Display name: the sender's push name, else the bare number of their id.
pub fn sender_display_name(msg: &InboundMessage) -> String {
    match msg.push_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => msg.sender_id.split('@').next().unwrap_or(&msg.sender_id).to_string(),
    }
}

pub fn classify_message(msg: &InboundMessage, keywords: &KeywordSets) -> ClassifiedMessage {
    let raw_text = msg.content.as_ref().map(extract_text).unwrap_or("").to_string();
    let kind = classify(&raw_text, msg.from_me, keywords);
    ClassifiedMessage {
        kind,
        sender_display_name: sender_display_name(msg),
        raw_text,
        conversation_id: msg.conversation_id.clone(),
        is_self_originated: msg.from_me,
        message_id: msg.id.clone(),
    }
}
