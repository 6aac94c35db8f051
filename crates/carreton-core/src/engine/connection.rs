// Carretón Engine — Reconnection Controller
//
// Owns the connection phase and the retry budget. Every adapter connection
// event passes through here; the controller answers with a `ReconnectDecision`
// and the session loop carries it out (scheduling a `RestartTimer`, or
// surfacing a terminal condition).
//
// Backoff: delay = min(base * 2^attempt, cap), attempt counted after the
// increment, so the first retry waits 2s with the default 1s base.

use crate::atoms::constants::{
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS, START_RETRY_DELAY_MS,
};
use crate::atoms::types::{ConnectionPhase, DisconnectReason, SessionEvent, TerminalCondition};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ── Policy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fixed wait after the start procedure itself fails.
    pub start_retry_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: RECONNECT_BASE_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
            start_retry_delay_ms: START_RETRY_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

// ── Decisions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Restart the session after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Stop retrying; an operator has to act.
    Terminal(TerminalCondition),
}

// ── Controller ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ReconnectionController {
    policy: ReconnectPolicy,
    phase: ConnectionPhase,
    attempts: u32,
    last_close_reason: Option<DisconnectReason>,
    qr_code: Option<String>,
    terminal: Option<TerminalCondition>,
    self_id: Option<String>,
}

impl ReconnectionController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        ReconnectionController {
            policy,
            phase: ConnectionPhase::Idle,
            attempts: 0,
            last_close_reason: None,
            qr_code: None,
            terminal: None,
            self_id: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_close_reason(&self) -> Option<DisconnectReason> {
        self.last_close_reason
    }

    pub fn qr_code(&self) -> Option<&str> {
        self.qr_code.as_deref()
    }

    pub fn terminal(&self) -> Option<TerminalCondition> {
        self.terminal
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Re-entrancy guard for the session-start procedure.
    pub fn may_start(&self) -> bool {
        !matches!(self.phase, ConnectionPhase::Connecting | ConnectionPhase::Open)
    }

    /// Called right before the start procedure is invoked.
    pub fn begin_start(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    pub fn on_qr(&mut self, payload: String) {
        info!("[reconnect] QR code presented ({} bytes) — waiting for scan", payload.len());
        self.qr_code = Some(payload);
    }

    pub fn on_connecting(&mut self) {
        debug!("[reconnect] Connecting...");
        self.phase = ConnectionPhase::Connecting;
    }

    pub fn on_open(&mut self, self_id: Option<String>) {
        self.phase = ConnectionPhase::Open;
        self.attempts = 0;
        self.qr_code = None;
        self.terminal = None;
        info!("[reconnect] Connected as {}", self_id.as_deref().unwrap_or("unknown"));
        self.self_id = self_id;
    }

    pub fn on_closed(&mut self, reason: DisconnectReason) -> ReconnectDecision {
        self.phase = ConnectionPhase::Closed;
        self.last_close_reason = Some(reason);
        self.qr_code = None;

        let code = reason.code().map(|c| c.to_string()).unwrap_or_else(|| "none".into());
        warn!("[reconnect] Connection closed (code {}): {}", code, reason.description());

        if !reason.is_transient() {
            error!("[reconnect] Session logged out — scan a new QR code to re-authenticate");
            self.terminal = Some(TerminalCondition::ReauthRequired);
            return ReconnectDecision::Terminal(TerminalCondition::ReauthRequired);
        }

        if self.attempts >= self.policy.max_attempts {
            return self.exhausted();
        }

        self.attempts += 1;
        let delay = self.policy.backoff_delay(self.attempts);
        info!(
            "[reconnect] Retrying in {}ms (attempt {}/{})",
            delay.as_millis(),
            self.attempts,
            self.policy.max_attempts
        );
        ReconnectDecision::Retry { attempt: self.attempts, delay }
    }

    /// The start procedure returned an error before any connection event.
    pub fn on_start_failed(&mut self) -> ReconnectDecision {
        self.phase = ConnectionPhase::Closed;
        if self.attempts >= self.policy.max_attempts {
            return self.exhausted();
        }
        self.attempts += 1;
        let delay = Duration::from_millis(self.policy.start_retry_delay_ms);
        info!(
            "[reconnect] Start failed — retrying in {}ms (attempt {}/{})",
            delay.as_millis(),
            self.attempts,
            self.policy.max_attempts
        );
        ReconnectDecision::Retry { attempt: self.attempts, delay }
    }

    /// Operator-initiated restart. The attempt counter is left alone; it only
    /// resets once the connection actually opens.
    pub fn clear_terminal(&mut self) {
        if let Some(t) = self.terminal.take() {
            info!("[reconnect] Clearing terminal condition {:?} on operator request", t);
        }
        if self.phase == ConnectionPhase::Closed {
            self.phase = ConnectionPhase::Idle;
        }
    }

    fn exhausted(&mut self) -> ReconnectDecision {
        error!(
            "[reconnect] Max reconnect attempts ({}) reached — restart the service manually",
            self.policy.max_attempts
        );
        self.terminal = Some(TerminalCondition::ManualRestartRequired);
        ReconnectDecision::Terminal(TerminalCondition::ManualRestartRequired)
    }
}

// ── Restart Timer ──────────────────────────────────────────────────────

/// Single-shot delayed restart. Expiry is delivered back into the session
/// queue as `SessionEvent::RestartDue`; stale expiries are recognised by
/// their generation number.
#[derive(Debug, Default)]
pub struct RestartTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl RestartTimer {
    pub fn schedule(&mut self, delay: Duration, tx: mpsc::Sender<SessionEvent>) -> u64 {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(SessionEvent::RestartDue { generation }).await.is_err() {
                debug!("[reconnect] Session gone before restart {} fired", generation);
            }
        }));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True if `generation` belongs to the pending timer. Consumes it.
    pub fn take_if_current(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for RestartTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
