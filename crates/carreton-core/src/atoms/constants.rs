// ── Carretón Atoms: Constants ──────────────────────────────────────────────
// All named constants for the engine live here.

// ── Reconnection ───────────────────────────────────────────────────────────
// Used by `ReconnectionController` in engine/connection.rs.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
/// Fixed delay before retrying when the session-start procedure itself fails.
pub const START_RETRY_DELAY_MS: u64 = 5_000;

// ── Admin command tokens ───────────────────────────────────────────────────
// Matched exactly after trim + lowercase. No arguments are accepted.
pub const CMD_SET_ORIGIN: &str = "!setorigen";
pub const CMD_SET_DESTINATION: &str = "!setdestino";
pub const CMD_STATUS: &str = "!status";
pub const CMD_LOGOUT: &str = "!logout";

// ── Default keyword sets ───────────────────────────────────────────────────
pub const DEFAULT_CANCELLATION_KEYWORDS: &[&str] = &[
    "cancelado",
    "cancelo",
    "canceló",
    "suspendido",
    "suspende",
    "anulado",
    "anula",
    "se suspende",
    "suspender",
    "cancelar",
];

pub const DEFAULT_SOLICITATION_KEYWORDS: &[&str] = &["solicito", "solicita", "fecha", "hora"];

// ── Message delivery ───────────────────────────────────────────────────────
/// Only batches delivered live are processed; history sync is skipped.
pub const DELIVERY_NOTIFY: &str = "notify";

/// Bound on the session event queue between the adapter and the engine loop.
pub const SESSION_EVENT_BUFFER: usize = 256;

/// Bound on forward jobs waiting for the outbox writer. Jobs beyond it are
/// dropped and counted as send failures.
pub const OUTBOX_BUFFER: usize = 64;

/// Default bound on session start and logout calls.
pub const CONTROL_TIMEOUT_SECS: u64 = 60;

/// Number of message-id characters appended to a generated request id.
pub const REQUEST_ID_SUFFIX_LEN: usize = 8;

/// Debug-log preview length for message bodies.
pub const LOG_PREVIEW_CHARS: usize = 50;
