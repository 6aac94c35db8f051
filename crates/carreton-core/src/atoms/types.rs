// ── Carretón Atoms: Pure Data Types ────────────────────────────────────────
// Plain struct/enum definitions shared by the engine and protocol adapters.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constants::{
    CMD_LOGOUT, CMD_SET_DESTINATION, CMD_SET_ORIGIN, CMD_STATUS, DELIVERY_NOTIFY,
};

// ── Connection ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Why the protocol client closed the connection.
/// Codes follow the Baileys `DisconnectReason` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    RestartRequired,
    Forbidden,
    UnavailableService,
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(408) => Self::ConnectionLost,
            Some(411) => Self::MultideviceMismatch,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(515) => Self::RestartRequired,
            Some(403) => Self::Forbidden,
            Some(503) => Self::UnavailableService,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::ConnectionLost => Some(408),
            Self::MultideviceMismatch => Some(411),
            Self::ConnectionClosed => Some(428),
            Self::ConnectionReplaced => Some(440),
            Self::BadSession => Some(500),
            Self::RestartRequired => Some(515),
            Self::Forbidden => Some(403),
            Self::UnavailableService => Some(503),
            Self::Unknown(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::LoggedOut => "Session logged out",
            Self::ConnectionLost => "Connection lost or timed out",
            Self::MultideviceMismatch => "Multi-device mismatch",
            Self::ConnectionClosed => "Connection closed",
            Self::ConnectionReplaced => "Connection replaced by another session",
            Self::BadSession => "Invalid session",
            Self::RestartRequired => "Restart required",
            Self::Forbidden => "Forbidden",
            Self::UnavailableService => "Service unavailable",
            Self::Unknown(_) => "Unknown reason",
        }
    }

    /// Only an explicit logout is terminal; everything else is transient.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::LoggedOut)
    }
}

/// A condition the controller cannot recover from on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalCondition {
    /// Logged out: a new QR scan is needed.
    ReauthRequired,
    /// Retry budget exhausted.
    ManualRestartRequired,
}

// ── Inbound messages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryType {
    Notify,
    Append,
    Other(String),
}

impl DeliveryType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            DELIVERY_NOTIFY => Self::Notify,
            "append" => Self::Append,
            other => Self::Other(other.to_string()),
        }
    }
}

/// The text-bearing parts of a message payload. Any may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image_caption: Option<String>,
    pub video_caption: Option<String>,
}

/// A message as delivered by the protocol client, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub conversation_id: String,
    /// Participant id in groups, the conversation id in direct chats.
    pub sender_id: String,
    pub push_name: Option<String>,
    pub from_me: bool,
    /// `None` for protocol/system messages with no payload.
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    SetOrigin,
    SetDestination,
    Status,
    Logout,
}

impl AdminCommand {
    pub fn from_token(normalized: &str) -> Option<Self> {
        match normalized {
            CMD_SET_ORIGIN => Some(Self::SetOrigin),
            CMD_SET_DESTINATION => Some(Self::SetDestination),
            CMD_STATUS => Some(Self::Status),
            CMD_LOGOUT => Some(Self::Logout),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::SetOrigin => CMD_SET_ORIGIN,
            Self::SetDestination => CMD_SET_DESTINATION,
            Self::Status => CMD_STATUS,
            Self::Logout => CMD_LOGOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    AdminCommand(AdminCommand),
    CancellationNotice,
    SolicitationRequest,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedMessage {
    pub kind: MessageKind,
    pub sender_display_name: String,
    pub raw_text: String,
    pub conversation_id: String,
    pub is_self_originated: bool,
    pub message_id: String,
}

// ── Outbound ───────────────────────────────────────────────────────────────

/// Enough of a message to quote it in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub conversation_id: String,
    pub from_me: bool,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub quoted: Option<MessageRef>,
}

// ── Session events ─────────────────────────────────────────────────────────

/// Everything the session loop consumes, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connecting,
    Open { self_id: Option<String> },
    Closed { reason: DisconnectReason },
    QrPresented { payload: String },
    CredentialsUpdated,
    MessageBatch { messages: Vec<InboundMessage>, delivery: DeliveryType },
    /// The backoff timer for `generation` expired.
    RestartDue { generation: u64 },
    /// Operator asked for a fresh session (clears terminal conditions).
    RestartRequested,
    /// Process is shutting down (signal).
    Shutdown,
}

// ── Request registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PedidoRecord {
    pub id: String,
    pub sender_display_name: String,
    pub raw_text: String,
    pub created_at: DateTime<Utc>,
    pub original_message_id: String,
}

// ── Status snapshot ────────────────────────────────────────────────────────

/// Read-only view of engine state published for monitoring surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub phase: ConnectionPhase,
    pub connected: bool,
    pub qr_code: Option<String>,
    pub reconnect_attempts: u32,
    pub terminal: Option<TerminalCondition>,
    pub last_close_reason: Option<DisconnectReason>,
    pub self_id: Option<String>,
    pub source_conversation_id: Option<String>,
    pub destination_conversation_id: Option<String>,
    pub ready: bool,
    pub registry_count: usize,
    pub send_failures: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            phase: ConnectionPhase::Idle,
            connected: false,
            qr_code: None,
            reconnect_attempts: 0,
            terminal: None,
            last_close_reason: None,
            self_id: None,
            source_conversation_id: None,
            destination_conversation_id: None,
            ready: false,
            registry_count: 0,
            send_failures: 0,
            started_at: Utc::now(),
        }
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_utf8(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
