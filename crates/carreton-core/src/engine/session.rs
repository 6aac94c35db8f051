// Carretón Engine — Session Loop
//
// One task owns every piece of mutable engine state (connection controller,
// routing config, request registry) and consumes `SessionEvent`s from a
// bounded queue, one at a time, interleaved with outcomes from the outbox
// writer. Adapters, the restart timer and operator surfaces only ever talk
// to it through that queue; monitoring reads the `StatusSnapshot`
// republished after each event.
//
// Every external call made from the loop is bounded: sends by
// `send_timeout`, session start and logout by `control_timeout`.

use super::classifier::KeywordSets;
use super::commands::RoutingConfig;
use super::connection::{ReconnectDecision, ReconnectPolicy, ReconnectionController, RestartTimer};
use super::routing::{BatchOutcome, RoutingEngine};
use crate::atoms::constants::{CONTROL_TIMEOUT_SECS, SESSION_EVENT_BUFFER};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::ProtocolClient;
use crate::atoms::types::{ConnectionPhase, DeliveryType, SessionEvent, StatusSnapshot};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: ReconnectPolicy,
    pub keywords: KeywordSets,
    pub routing: RoutingConfig,
    pub send_timeout: Duration,
    pub control_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            policy: ReconnectPolicy::default(),
            keywords: KeywordSets::default(),
            routing: RoutingConfig::default(),
            send_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(CONTROL_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// `!logout` was executed.
    LoggedOut,
    /// Process shutdown was requested.
    Shutdown,
    /// Every sender was dropped.
    QueueClosed,
}

pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    status: Arc<Mutex<StatusSnapshot>>,
    task: JoinHandle<SessionExit>,
}

impl SessionHandle {
    /// Queue for adapters and operator surfaces.
    pub fn events(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }

    pub fn status(&self) -> Arc<Mutex<StatusSnapshot>> {
        self.status.clone()
    }

    pub async fn wait(self) -> SessionExit {
        drop(self.events);
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("[session] Session task failed: {}", e);
                SessionExit::QueueClosed
            }
        }
    }
}

/// Bounded queue feeding the session loop.
pub fn session_queue() -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(SESSION_EVENT_BUFFER)
}

/// Start the session loop. The first session start is issued immediately.
pub fn spawn_session(client: Arc<dyn ProtocolClient>, settings: SessionSettings) -> SessionHandle {
    spawn_session_with_queue(client, settings, session_queue())
}

/// Like `spawn_session`, on a queue created beforehand so adapters can hold
/// a sender before the first start is issued.
pub fn spawn_session_with_queue(
    client: Arc<dyn ProtocolClient>,
    settings: SessionSettings,
    (tx, rx): (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>),
) -> SessionHandle {
    let started_at = Utc::now();
    let status = Arc::new(Mutex::new(StatusSnapshot { started_at, ..Default::default() }));

    let session = Session {
        engine: RoutingEngine::new(
            client.clone(),
            settings.routing,
            settings.keywords,
            settings.send_timeout,
        ),
        controller: ReconnectionController::new(settings.policy),
        timer: RestartTimer::default(),
        control_timeout: settings.control_timeout,
        client,
        status: status.clone(),
        started_at,
        tx: tx.downgrade(),
        rx,
    };

    let task = tokio::spawn(session.run());
    SessionHandle { events: tx, status, task }
}

struct Session {
    client: Arc<dyn ProtocolClient>,
    controller: ReconnectionController,
    timer: RestartTimer,
    control_timeout: Duration,
    engine: RoutingEngine,
    status: Arc<Mutex<StatusSnapshot>>,
    started_at: DateTime<Utc>,
    /// Handed to the restart timer so expiries re-enter the queue. Weak so
    /// the loop ends once every external sender is gone.
    tx: mpsc::WeakSender<SessionEvent>,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Session {
    async fn run(mut self) -> SessionExit {
        info!("[session] Starting {} session", self.client.name());
        self.start().await;
        self.publish();

        loop {
            let event = tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(settled) = self.engine.next_settled() => {
                    self.engine.settle(settled);
                    self.publish();
                    continue;
                }
            };
            let flow = self.handle_event(event).await;
            self.publish();
            if let ControlFlow::Break(exit) = flow {
                self.timer.cancel();
                info!("[session] Session ended: {:?}", exit);
                return exit;
            }
        }
        SessionExit::QueueClosed
    }

    async fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<SessionExit> {
        match event {
            SessionEvent::Connecting => self.controller.on_connecting(),
            SessionEvent::Open { self_id } => {
                self.timer.cancel();
                self.controller.on_open(self_id);
            }
            SessionEvent::Closed { reason } => {
                let decision = self.controller.on_closed(reason);
                self.apply(decision);
            }
            SessionEvent::QrPresented { payload } => self.controller.on_qr(payload),
            SessionEvent::CredentialsUpdated => debug!("[session] Credentials updated"),
            SessionEvent::MessageBatch { messages, delivery } => {
                if delivery != DeliveryType::Notify {
                    let count = messages.len();
                    debug!("[session] Skipping {:?} batch of {} message(s)", delivery, count);
                    return ControlFlow::Continue(());
                }
                if self.engine.handle_batch(&messages).await == BatchOutcome::LoggedOut {
                    self.logout().await;
                    return ControlFlow::Break(SessionExit::LoggedOut);
                }
            }
            SessionEvent::RestartDue { generation } => {
                if self.timer.take_if_current(generation) {
                    self.start().await;
                } else {
                    debug!("[session] Ignoring stale restart {}", generation);
                }
            }
            SessionEvent::RestartRequested => {
                self.timer.cancel();
                self.controller.clear_terminal();
                self.start().await;
            }
            SessionEvent::Shutdown => {
                info!("[session] Shutdown requested — logging out");
                if tokio::time::timeout(self.control_timeout, self.engine.flush()).await.is_err() {
                    warn!("[session] Abandoning forwards still in flight");
                }
                self.logout().await;
                return ControlFlow::Break(SessionExit::Shutdown);
            }
        }
        ControlFlow::Continue(())
    }

    /// Invoke the session-start procedure unless one is already in flight.
    async fn start(&mut self) {
        if !self.controller.may_start() {
            debug!("[session] Start skipped — session already {:?}", self.controller.phase());
            return;
        }
        self.controller.begin_start();
        let started = bounded(self.control_timeout, self.client.start_session()).await;
        if let Err(e) = started {
            error!("[session] Failed to start {} session: {}", self.client.name(), e);
            let decision = self.controller.on_start_failed();
            self.apply(decision);
        }
    }

    async fn logout(&mut self) {
        if let Err(e) = bounded(self.control_timeout, self.client.logout()).await {
            warn!("[session] Logout failed: {}", e);
        }
    }

    fn apply(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                let Some(tx) = self.tx.upgrade() else {
                    debug!("[session] Queue closed — not scheduling attempt {}", attempt);
                    return;
                };
                let generation = self.timer.schedule(delay, tx);
                debug!(
                    "[session] Restart {} scheduled for attempt {} in {:?}",
                    generation, attempt, delay
                );
            }
            ReconnectDecision::Terminal(condition) => {
                self.timer.cancel();
                warn!("[session] Terminal condition: {:?}", condition);
            }
        }
    }

    fn publish(&self) {
        let routing = self.engine.routing();
        let snapshot = StatusSnapshot {
            phase: self.controller.phase(),
            connected: self.controller.phase() == ConnectionPhase::Open,
            qr_code: self.controller.qr_code().map(str::to_string),
            reconnect_attempts: self.controller.attempts(),
            terminal: self.controller.terminal(),
            last_close_reason: self.controller.last_close_reason(),
            self_id: self.controller.self_id().map(str::to_string),
            source_conversation_id: routing.source.clone(),
            destination_conversation_id: routing.destination.clone(),
            ready: routing.is_ready(),
            registry_count: self.engine.registry().len(),
            send_failures: self.engine.send_failures(),
            started_at: self.started_at,
        };
        *self.status.lock() = snapshot;
    }
}

/// Run a control call (start, logout) under `limit`.
async fn bounded<F>(limit: Duration, call: F) -> EngineResult<()>
where
    F: Future<Output = EngineResult<()>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit.as_secs())),
    }
}
