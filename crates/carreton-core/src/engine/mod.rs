// Carretón Engine — session lifecycle and message routing
//
//   connection — ReconnectionController, ReconnectPolicy, RestartTimer
//   classifier — KeywordSets, extract_text, classify, classify_message
//   registry   — RequestRegistry (PedidoRecord store)
//   commands   — RoutingConfig, dispatch, status_report
//   routing    — RoutingEngine, extract_request_number, compose_*
//   outbox     — Outbox writer task delivering forward + acknowledgment pairs
//   session    — spawn_session, SessionHandle (single-consumer event loop)

pub mod classifier;
pub mod commands;
pub mod connection;
pub mod outbox;
pub mod registry;
pub mod routing;
pub mod session;

pub use classifier::KeywordSets;
pub use commands::RoutingConfig;
pub use connection::ReconnectPolicy;
