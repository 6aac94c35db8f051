// Carretón Engine — Outbox
//
// Forward + acknowledgment pairs are delivered by a dedicated writer task so
// a stalled send API never holds up the session loop. Jobs run one at a time
// in queue order and every send is bounded by the send timeout. Outcomes are
// reported back as `Settled` values; the registry stays with its owner.

use crate::atoms::constants::OUTBOX_BUFFER;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::ProtocolClient;
use crate::atoms::types::{MessageRef, PedidoRecord, SendOptions};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// One forward to the destination followed by a quoted acknowledgment in
/// the source. The acknowledgment is only sent once the forward lands.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    /// Log label, e.g. `Solicitation 1700000000000-3EB0C767 from Ana`.
    pub label: String,
    pub destination: String,
    pub text: String,
    pub source: String,
    pub ack: String,
    pub quoted: MessageRef,
    /// Registered once the forward lands. Solicitations only.
    pub record: Option<PedidoRecord>,
}

/// Result of one `ForwardJob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub record: Option<PedidoRecord>,
    pub forwarded: bool,
    /// Failed sends (forward and/or acknowledgment) in this job.
    pub failures: u64,
}

enum OutboxJob {
    Forward(ForwardJob),
    /// Answered once every job queued before it has settled.
    Flush(oneshot::Sender<()>),
}

pub struct Outbox {
    jobs: mpsc::Sender<OutboxJob>,
    settled: mpsc::UnboundedReceiver<Settled>,
}

impl Outbox {
    pub fn spawn(client: Arc<dyn ProtocolClient>, send_timeout: Duration) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(OUTBOX_BUFFER);
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(client, send_timeout, jobs_rx, settled_tx));
        Outbox { jobs: jobs_tx, settled: settled_rx }
    }

    /// Queue a job without waiting. Returns `false` when the outbox is full
    /// or the writer is gone; the job is dropped.
    pub fn enqueue(&self, job: ForwardJob) -> bool {
        match self.jobs.try_send(OutboxJob::Forward(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("[outbox] Queue full ({} jobs)", OUTBOX_BUFFER);
                false
            }
            Err(TrySendError::Closed(_)) => {
                error!("[outbox] Writer task has stopped");
                false
            }
        }
    }

    /// Next settled job. Cancel safe.
    pub async fn next_settled(&mut self) -> Option<Settled> {
        self.settled.recv().await
    }

    /// Wait for every job queued so far, returning the outcomes not yet
    /// collected through `next_settled`.
    pub async fn flush(&mut self) -> Vec<Settled> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.jobs.send(OutboxJob::Flush(done_tx)).await.is_ok() && done_rx.await.is_err() {
            debug!("[outbox] Writer dropped a flush marker");
        }
        let mut settled = Vec::new();
        while let Ok(outcome) = self.settled.try_recv() {
            settled.push(outcome);
        }
        settled
    }
}

async fn run_writer(
    client: Arc<dyn ProtocolClient>,
    send_timeout: Duration,
    mut jobs: mpsc::Receiver<OutboxJob>,
    settled: mpsc::UnboundedSender<Settled>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            OutboxJob::Forward(job) => {
                let outcome = deliver(client.as_ref(), send_timeout, job).await;
                if settled.send(outcome).is_err() {
                    break;
                }
            }
            OutboxJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("[outbox] Writer task exiting");
}

async fn deliver(client: &dyn ProtocolClient, send_timeout: Duration, job: ForwardJob) -> Settled {
    let ForwardJob { label, destination, text, source, ack, quoted, record } = job;

    let forward = SendOptions::default();
    if let Err(e) = send_with_timeout(client, send_timeout, &destination, &text, forward).await {
        error!("[outbox] {} not forwarded via {}: {}", label, client.name(), e);
        return Settled { record, forwarded: false, failures: 1 };
    }
    info!("[outbox] {} forwarded", label);

    let options = SendOptions { quoted: Some(quoted) };
    let failures = match send_with_timeout(client, send_timeout, &source, &ack, options).await {
        Ok(()) => 0,
        Err(e) => {
            error!("[outbox] Acknowledgment for {} failed: {}", label, e);
            1
        }
    };
    Settled { record, forwarded: true, failures }
}

/// `client.send` bounded by `send_timeout`.
pub async fn send_with_timeout(
    client: &dyn ProtocolClient,
    send_timeout: Duration,
    conversation_id: &str,
    text: &str,
    options: SendOptions,
) -> EngineResult<()> {
    match tokio::time::timeout(send_timeout, client.send(conversation_id, text, options)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("[outbox] Send to {} timed out", conversation_id);
            Err(EngineError::Timeout(send_timeout.as_secs()))
        }
    }
}
