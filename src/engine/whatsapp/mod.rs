// Carretón Relay — WhatsApp Bridge (via Evolution API)
//
// Module layout:
//   config        — EvolutionConfig
//   evolution_api — EvolutionClient (ProtocolClient): create/connect/delete
//                   instance, sendText, logout
//   webhook       — translate_webhook, parse_inbound_message, extract_qr

pub mod config;
pub mod evolution_api;
pub mod webhook;

pub use config::EvolutionConfig;
pub use evolution_api::EvolutionClient;
