// Carretón Relay — Process wiring
//
// Binds the listener, starts the session loop over the Evolution client and
// waits for either the session to end (`!logout`) or a shutdown signal.

use carreton_core::atoms::types::SessionEvent;
use carreton_core::{session_queue, spawn_session_with_queue, EngineResult, SessionExit};
use log::{error, info, warn};
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::engine::listener::{bind_listener, run_listener, ListenerState};
use crate::engine::whatsapp::EvolutionClient;

/// `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

pub async fn run(config: RelayConfig) -> EngineResult<SessionExit> {
    // Fail before touching the Evolution instance if the port is taken.
    let listener = bind_listener(&config.listener).await?;

    let webhook_url = config.webhook_url();
    info!(
        "[relay] Evolution API {} instance '{}', webhook {}",
        config.evolution.api_url, config.evolution.instance_name, webhook_url
    );
    if config.routing.is_ready() {
        info!("[relay] Routing preconfigured from configuration");
    } else {
        info!("[relay] Routing not configured — send !setorigen and !setdestino in the groups");
    }

    let client = Arc::new(EvolutionClient::new(
        config.evolution.clone(),
        webhook_url,
        config.send_timeout(),
    )?);
    let (tx, rx) = session_queue();
    client.attach(&tx);

    let handle = spawn_session_with_queue(client, config.session_settings(), (tx, rx));
    let events = handle.events();
    let state = ListenerState {
        events: events.clone(),
        status: handle.status(),
        read_timeout: config.listener.read_timeout(),
    };

    let listener_task = tokio::spawn(async move {
        if let Err(e) = run_listener(listener, state).await {
            error!("[monitor] Listener stopped: {}", e);
        }
    });

    let mut session = tokio::spawn(handle.wait());
    let finished = tokio::select! {
        joined = &mut session => Some(joined),
        _ = shutdown_signal() => None,
    };
    let exit = match finished {
        Some(joined) => joined,
        None => {
            if events.send(SessionEvent::Shutdown).await.is_err() {
                warn!("[relay] Session already stopped");
            }
            session.await
        }
    };

    listener_task.abort();
    let exit = exit.unwrap_or_else(|e| {
        error!("[relay] Session task failed: {}", e);
        SessionExit::QueueClosed
    });
    info!("[relay] Exiting: {:?}", exit);
    Ok(exit)
}

/// Resolves on SIGINT (ctrl-c) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[relay] Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("[relay] Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[relay] Received Ctrl+C, shutting down"),
        _ = terminate => info!("[relay] Received SIGTERM, shutting down"),
    }
}
